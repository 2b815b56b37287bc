//! Redis implementation of the remote cache protocol.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use url::Url;

use crate::cache::{RemoteConnection, RemoteConnector, RemoteError};

use super::error::InfraError;

const SCAN_BATCH: usize = 500;

/// Opens multiplexed connections to one Redis endpoint.
pub struct RedisConnector {
    client: redis::Client,
    target: String,
}

impl RedisConnector {
    pub fn new(url: &str) -> Result<Self, InfraError> {
        let client = redis::Client::open(url)
            .map_err(|err| InfraError::redis(format!("invalid redis url: {err}")))?;
        Ok(Self {
            client,
            target: redact(url),
        })
    }
}

/// `scheme://host:port/db` without credentials.
fn redact(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("localhost");
            let port = parsed
                .port()
                .map(|port| format!(":{port}"))
                .unwrap_or_default();
            format!("{}://{host}{port}{}", parsed.scheme(), parsed.path())
        }
        Err(_) => "redis".to_string(),
    }
}

#[async_trait]
impl RemoteConnector for RedisConnector {
    fn describe(&self) -> String {
        self.target.clone()
    }

    async fn connect(&self) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        Ok(Arc::new(RedisConnection { connection }))
    }
}

pub struct RedisConnection {
    connection: MultiplexedConnection,
}

impl RedisConnection {
    fn handle(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn classify(err: RedisError) -> RemoteError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        RemoteError::connection(err.to_string())
    } else {
        RemoteError::command(err.to_string())
    }
}

#[async_trait]
impl RemoteConnection for RedisConnection {
    async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.handle();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let mut conn = self.handle();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(classify)?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expire_seconds: Option<u64>,
    ) -> Result<(), RemoteError> {
        let mut conn = self.handle();
        let mut command = redis::cmd("SET");
        command.arg(key).arg(value);
        if let Some(seconds) = expire_seconds {
            command.arg("EX").arg(seconds);
        }
        let _: () = command.query_async(&mut conn).await.map_err(classify)?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.handle();
        let removed: u64 = conn.del(keys).await.map_err(classify)?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.handle();
        let found: bool = conn.exists(key).await.map_err(classify)?;
        Ok(found)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, RemoteError> {
        let mut conn = self.handle();
        let updated: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(updated)
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<u64>, RemoteError> {
        let mut conn = self.handle();
        let seconds: i64 = conn.ttl(key).await.map_err(classify)?;
        Ok(match seconds {
            -1 => None,
            seconds => Some(u64::try_from(seconds).unwrap_or(0)),
        })
    }

    async fn persist(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.handle();
        let updated: bool = conn.persist(key).await.map_err(classify)?;
        Ok(updated)
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, RemoteError> {
        let mut conn = self.handle();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(classify)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<(), RemoteError> {
        let mut conn = self.handle();
        let _: u64 = conn.sadd(set_key, member).await.map_err(classify)?;
        Ok(())
    }

    async fn remove_from_set(&self, set_key: &str, member: &str) -> Result<(), RemoteError> {
        let mut conn = self.handle();
        let _: u64 = conn.srem(set_key, member).await.map_err(classify)?;
        Ok(())
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, RemoteError> {
        let mut conn = self.handle();
        let members: Vec<String> = conn.smembers(set_key).await.map_err(classify)?;
        Ok(members)
    }

    async fn flush_db(&self) -> Result<(), RemoteError> {
        let mut conn = self.handle();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
