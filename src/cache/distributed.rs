//! [`CacheStore`] over the remote key-value store.
//!
//! Every call goes through the connection manager: while it is not ready the
//! adapter reports `Unavailable` without touching the network, and any
//! connection-class failure drops readiness immediately.
//!
//! Tags live in two places: a set per tag (`{ns}:tag:{tag}`) listing its keys,
//! and a record per key (`{ns}:tags:{key}`) listing its tags. The record lets
//! a rewrite or delete pull the key out of every set it joined. A tag set
//! never expires before the longest-lived member it was given.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::connection::ConnectionManager;
use super::entry::Ttl;
use super::remote::{RemoteConnection, RemoteError};
use super::store::{CacheStore, StoreError, validate_key};

const DELETE_CHUNK: usize = 500;

pub struct DistributedStoreAdapter {
    manager: Arc<ConnectionManager>,
    tag_prefix: String,
    record_prefix: String,
}

impl DistributedStoreAdapter {
    /// `namespace` scopes the tag sets and the per-key tag records.
    pub fn new(manager: Arc<ConnectionManager>, namespace: &str) -> Self {
        Self {
            manager,
            tag_prefix: format!("{namespace}:tag:"),
            record_prefix: format!("{namespace}:tags:"),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn is_ready(&self) -> bool {
        self.manager.is_ready()
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}{tag}", self.tag_prefix)
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{key}", self.record_prefix)
    }

    fn is_index_key(&self, key: &str) -> bool {
        key.starts_with(&self.tag_prefix) || key.starts_with(&self.record_prefix)
    }

    fn connection(&self) -> Result<Arc<dyn RemoteConnection>, StoreError> {
        self.manager
            .connection()
            .ok_or_else(|| StoreError::Unavailable(self.manager.state().as_str().to_string()))
    }

    fn translate(&self, err: RemoteError) -> StoreError {
        self.manager.report_failure(&err);
        match err {
            RemoteError::Connection(message) => StoreError::Unavailable(message),
            RemoteError::Command(message) => StoreError::Backend(message),
        }
    }

    async fn delete_keys(
        &self,
        connection: &dyn RemoteConnection,
        keys: &[String],
    ) -> Result<u64, StoreError> {
        let mut removed = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            removed += connection
                .del(chunk)
                .await
                .map_err(|err| self.translate(err))?;
        }
        Ok(removed)
    }

    /// Drop `keys` from every tag set their records name, then the records.
    async fn unindex(
        &self,
        connection: &dyn RemoteConnection,
        keys: &[String],
    ) -> Result<(), StoreError> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let record = self.record_key(key);
            let tags = connection
                .set_members(&record)
                .await
                .map_err(|err| self.translate(err))?;
            for tag in tags {
                connection
                    .remove_from_set(&self.tag_key(&tag), key)
                    .await
                    .map_err(|err| self.translate(err))?;
            }
            records.push(record);
        }
        self.delete_keys(connection, &records).await?;
        Ok(())
    }

    /// Add `key` to the set of `tag` and make sure the set outlives it.
    async fn join_tag(
        &self,
        connection: &dyn RemoteConnection,
        tag: &str,
        key: &str,
        seconds: Option<u64>,
    ) -> Result<(), RemoteError> {
        let set_key = self.tag_key(tag);
        let remaining = connection.time_to_live(&set_key).await?;
        connection.add_to_set(&set_key, key).await?;
        self.stretch(connection, &set_key, remaining, seconds).await
    }

    /// Extend the expiry of a tag set that currently has `remaining` seconds
    /// left so it covers a member living `seconds`.
    async fn stretch(
        &self,
        connection: &dyn RemoteConnection,
        set_key: &str,
        remaining: Option<u64>,
        seconds: Option<u64>,
    ) -> Result<(), RemoteError> {
        match (seconds, remaining) {
            (None, _) => {
                connection.persist(set_key).await?;
            }
            (Some(_), None) => {}
            (Some(seconds), Some(remaining)) if remaining >= seconds => {}
            (Some(seconds), Some(_)) => {
                connection.expire(set_key, seconds).await?;
            }
        }
        Ok(())
    }

    /// Give the tag record of `key` and its tag sets the key's new lifetime.
    async fn retime_tags(
        &self,
        connection: &dyn RemoteConnection,
        key: &str,
        seconds: Option<u64>,
    ) -> Result<(), RemoteError> {
        let record = self.record_key(key);
        let tags = connection.set_members(&record).await?;
        if tags.is_empty() {
            return Ok(());
        }
        for tag in &tags {
            let set_key = self.tag_key(tag);
            let remaining = connection.time_to_live(&set_key).await?;
            self.stretch(connection, &set_key, remaining, seconds).await?;
        }
        match seconds {
            Some(seconds) => connection.expire(&record, seconds).await?,
            None => connection.persist(&record).await?,
        };
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DistributedStoreAdapter {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        validate_key(key)?;
        let connection = self.connection()?;
        let value = connection
            .get(key)
            .await
            .map_err(|err| self.translate(err))?;
        Ok(value.map(Bytes::from))
    }

    async fn set_tagged(
        &self,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        tags: &[String],
    ) -> Result<(), StoreError> {
        validate_key(key)?;
        let connection = self.connection()?;
        let seconds = ttl.as_whole_seconds();
        self.unindex(connection.as_ref(), &[key.to_string()]).await?;
        connection
            .set(key, &value, seconds)
            .await
            .map_err(|err| self.translate(err))?;
        if tags.is_empty() {
            return Ok(());
        }

        let record = self.record_key(key);
        let indexed: Result<(), RemoteError> = async {
            for tag in tags {
                self.join_tag(connection.as_ref(), tag, key, seconds).await?;
                connection.add_to_set(&record, tag).await?;
            }
            if let Some(seconds) = seconds {
                connection.expire(&record, seconds).await?;
            }
            Ok(())
        }
        .await;
        indexed.map_err(|err| self.translate(err))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let connection = self.connection()?;
        let keys = [key.to_string()];
        self.unindex(connection.as_ref(), &keys).await?;
        let removed = self.delete_keys(connection.as_ref(), &keys).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let connection = self.connection()?;
        connection
            .exists(key)
            .await
            .map_err(|err| self.translate(err))
    }

    async fn expire(&self, key: &str, ttl: Ttl) -> Result<bool, StoreError> {
        validate_key(key)?;
        let connection = self.connection()?;
        let seconds = ttl.as_whole_seconds();
        let outcome: Result<bool, RemoteError> = async {
            let updated = match seconds {
                Some(seconds) => connection.expire(key, seconds).await?,
                // PERSIST answers false for keys that had no expiry; report
                // presence instead so both tiers agree.
                None => connection.persist(key).await? || connection.exists(key).await?,
            };
            if updated {
                self.retime_tags(connection.as_ref(), key, seconds).await?;
            }
            Ok(updated)
        }
        .await;
        outcome.map_err(|err| self.translate(err))
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        if pattern.is_empty() {
            return Err(StoreError::invalid_pattern(pattern, "pattern must not be empty"));
        }
        let connection = self.connection()?;
        let mut keys = connection
            .scan_match(pattern)
            .await
            .map_err(|err| self.translate(err))?;
        keys.retain(|key| !self.is_index_key(key));
        if keys.is_empty() {
            return Ok(0);
        }
        self.unindex(connection.as_ref(), &keys).await?;
        self.delete_keys(connection.as_ref(), &keys).await
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<u64, StoreError> {
        let connection = self.connection()?;
        let set_key = self.tag_key(tag);
        let members = connection
            .set_members(&set_key)
            .await
            .map_err(|err| self.translate(err))?;
        self.unindex(connection.as_ref(), &members).await?;
        let removed = self.delete_keys(connection.as_ref(), &members).await?;
        self.delete_keys(connection.as_ref(), &[set_key]).await?;
        Ok(removed)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let connection = self.connection()?;
        connection
            .flush_db()
            .await
            .map_err(|err| self.translate(err))
    }
}
