//! Store key construction
//!
//! Keys have the shape `{prefix}-{app}-{func}-{caller}`. The app and function
//! names act as the policy namespace so two policies guarding different
//! operations never share state for the same caller.

/// Deterministic mapping from a caller key to a store key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
    app_name: String,
    func_name: String,
}

impl KeyBuilder {
    /// Create a key builder for one policy namespace
    pub fn new(
        prefix: impl Into<String>,
        app_name: impl Into<String>,
        func_name: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            app_name: app_name.into(),
            func_name: func_name.into(),
        }
    }

    /// Same prefix and app, different function namespace
    pub fn with_func_name(&self, func_name: impl Into<String>) -> Self {
        Self {
            func_name: func_name.into(),
            ..self.clone()
        }
    }

    /// The namespace key without a caller segment
    pub fn base_key(&self) -> String {
        format!("{}-{}-{}", self.prefix, self.app_name, self.func_name)
    }

    /// Store key for `caller`; an empty caller yields the base key
    pub fn key(&self, caller: &str) -> String {
        if caller.is_empty() {
            self.base_key()
        } else {
            format!("{}-{}", self.base_key(), caller)
        }
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("ratelimit", "default", "default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyBuilder::new("testPrefix", "testApp", "testFunc");
        assert_eq!(keys.key("testKey"), "testPrefix-testApp-testFunc-testKey");
        assert_eq!(keys.key(""), "testPrefix-testApp-testFunc");
    }

    #[test]
    fn test_deterministic() {
        let a = KeyBuilder::new("rl", "api", "login");
        let b = KeyBuilder::new("rl", "api", "login");
        assert_eq!(a.key("10.0.0.1"), b.key("10.0.0.1"));
        assert_ne!(a.key("10.0.0.1"), a.key("10.0.0.2"));
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let login = KeyBuilder::new("rl", "api", "login");
        let search = login.with_func_name("search");
        assert_ne!(login.key("u1"), search.key("u1"));
        assert_eq!(search.key("u1"), "rl-api-search-u1");
    }
}
