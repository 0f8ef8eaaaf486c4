//! Checked-out connections.

use bb8::PooledConnection;
use bb8_redis::RedisConnectionManager;
use redis::FromRedisValue;
use redis::aio::MultiplexedConnection;
use std::ops::{Deref, DerefMut};

use crate::Result;

/// A Redis connection held exclusively until dropped.
///
/// Dereferences to the multiplexed connection so every `AsyncCommands`
/// method is available. Optimistic transactions go through [`watch`],
/// [`unwatch`] and [`exec_watched`], which keep track of whether a `WATCH`
/// is pending on this connection.
///
/// [`watch`]: RedisConnection::watch
/// [`unwatch`]: RedisConnection::unwatch
/// [`exec_watched`]: RedisConnection::exec_watched
pub struct RedisConnection<'a> {
    conn: PooledConnection<'a, RedisConnectionManager>,
    watching: bool,
}

impl<'a> RedisConnection<'a> {
    pub(crate) fn new(conn: PooledConnection<'a, RedisConnectionManager>) -> Self {
        Self {
            conn,
            watching: false,
        }
    }

    /// `WATCH` a single key.
    ///
    /// Any watch still registered on the connection is released first, so a
    /// previous holder that was cancelled or bailed out mid-transaction
    /// cannot make this transaction abort.
    pub async fn watch(&mut self, key: &str) -> Result<()> {
        let _: () = redis::pipe()
            .cmd("UNWATCH")
            .ignore()
            .cmd("WATCH")
            .arg(key)
            .ignore()
            .query_async(&mut *self.conn)
            .await?;
        self.watching = true;
        Ok(())
    }

    /// Release a pending watch. A no-op when nothing is watched.
    pub async fn unwatch(&mut self) -> Result<()> {
        if self.watching {
            let _: () = redis::cmd("UNWATCH").query_async(&mut *self.conn).await?;
            self.watching = false;
        }
        Ok(())
    }

    /// Run an atomic pipeline under the current watch.
    ///
    /// Returns `None` when a watched key changed and the server discarded
    /// the transaction. The watch is released either way.
    pub async fn exec_watched<T: FromRedisValue>(
        &mut self,
        pipe: &redis::Pipeline,
    ) -> Result<Option<T>> {
        self.watching = false;
        let result: Option<T> = pipe.query_async(&mut *self.conn).await?;
        Ok(result)
    }

    /// Whether a `WATCH` issued through this handle is still pending.
    pub fn is_watching(&self) -> bool {
        self.watching
    }
}

impl Deref for RedisConnection<'_> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for RedisConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
