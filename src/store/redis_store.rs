//! Redis adapter for the [`Store`] trait.
//!
//! Commands go out as one `redis::pipe()`; transactions are the same pipe
//! marked `.atomic()` (MULTI/EXEC). Expiry events come from a dedicated
//! pub/sub connection subscribed to `__keyevent@*__:expired`, which carries
//! the expired key name as payload.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};

use super::{Cmd, ExpiryStream, Reply, Store, StoreError};

/// Pattern matching expiry events of every database.
pub const EXPIRED_PATTERN: &str = "__keyevent@*__:expired";

/// Redis-backed store with connection pooling via `ConnectionManager`.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn_manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            StoreError::Connection(format!("failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            StoreError::Connection(format!("failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self {
            client,
            conn_manager,
        })
    }

    /// Turn on expired-key events server side (`notify-keyspace-events Ex`).
    /// Managed Redis offerings often forbid CONFIG, so this is opt-in.
    pub async fn enable_expiry_events(&self) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        tracing::info!("enabled notify-keyspace-events Ex");
        Ok(())
    }

    async fn run(&self, cmds: Vec<Cmd>, atomic: bool) -> Result<Vec<Reply>, StoreError> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn_manager.clone();
        let mut pipe = redis::pipe();
        if atomic {
            pipe.atomic();
        }
        for cmd in &cmds {
            match cmd {
                Cmd::Get(key) => pipe.get(key),
                Cmd::Set(key, value) => pipe.set(key, value),
                Cmd::GetSet(key, value) => pipe.getset(key, value),
                Cmd::SetPx(key, value, ttl_ms) => pipe.pset_ex(key, value, *ttl_ms),
                Cmd::SetNxPx(key, value, ttl_ms) => {
                    pipe.cmd("SET").arg(key).arg(value).arg("NX").arg("PX").arg(*ttl_ms)
                }
                Cmd::IncrBy(key, delta) => pipe.incr(key, *delta),
                Cmd::Del(key) => pipe.del(key),
                Cmd::PTtl(key) => pipe.pttl(key),
                Cmd::HSet(key, fields) => pipe.hset_multiple(key, fields.as_slice()),
            };
        }

        let values: Vec<redis::Value> = pipe.query_async(&mut conn).await.map_err(map_err)?;
        if values.len() != cmds.len() {
            return Err(StoreError::UnexpectedReply("pipeline reply count"));
        }
        values.into_iter().map(to_reply).collect()
    }
}

fn map_err(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

fn to_reply(value: redis::Value) -> Result<Reply, StoreError> {
    match value {
        redis::Value::Nil => Ok(Reply::Nil),
        redis::Value::Int(n) => Ok(Reply::Int(n)),
        redis::Value::BulkString(bytes) => Ok(Reply::Str(String::from_utf8_lossy(&bytes).into_owned())),
        redis::Value::SimpleString(s) => Ok(Reply::Str(s)),
        redis::Value::Okay => Ok(Reply::Ok),
        _ => Err(StoreError::UnexpectedReply("non-scalar reply")),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn transaction(&self, cmds: Vec<Cmd>) -> Result<Vec<Reply>, StoreError> {
        self.run(cmds, true).await
    }

    async fn pipeline(&self, cmds: Vec<Cmd>) -> Result<Vec<Reply>, StoreError> {
        self.run(cmds, false).await
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<(String, String)>), StoreError> {
        let mut conn = self.conn_manager.clone();
        let page: (u64, Vec<(String, String)>) = redis::cmd("HSCAN")
            .arg(key)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(page)
    }

    async fn expired_keys(&self) -> Result<ExpiryStream, StoreError> {
        // Own connection: pub/sub blocks for the process lifetime, so it must
        // not share the request connection and carries no response timeout.
        let mut pubsub = self.client.get_async_pubsub().await.map_err(map_err)?;
        pubsub.psubscribe(EXPIRED_PATTERN).await.map_err(map_err)?;
        tracing::info!(pattern = EXPIRED_PATTERN, "subscribed to expiry events");

        let stream = pubsub.into_on_message().map(|msg| {
            msg.get_payload::<String>()
                .map_err(|e| StoreError::Command(format!("bad expiry payload: {e}")))
        });
        Ok(stream.boxed())
    }
}
