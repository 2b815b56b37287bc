//! In-process stand-in for the remote store, with switchable failures.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gazette::cache::{
    CacheConfig, CacheService, ConnectionManager, ConnectionSettings, ConnectionState,
    DistributedStoreAdapter, RemoteConnection, RemoteConnector, RemoteError, RetryPolicy,
    glob_to_regex,
};

type Members = (BTreeSet<String>, Option<u64>);

/// Keeps string values and sets in separate maps; both share the keyspace,
/// so existence, expiry and scans see either kind.
#[derive(Default)]
pub struct FakeRemote {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<u64>)>>,
    sets: Mutex<HashMap<String, Members>>,
    failing: AtomicBool,
    commands: AtomicUsize,
}

impl FakeRemote {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn expiry_of(&self, key: &str) -> Option<u64> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .and_then(|(_, expiry)| *expiry)
    }

    pub fn members_of(&self, set_key: &str) -> Vec<String> {
        self.sets
            .lock()
            .unwrap()
            .get(set_key)
            .map(|(members, _)| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_set(&self, set_key: &str) -> bool {
        self.sets.lock().unwrap().contains_key(set_key)
    }

    pub fn set_expiry_of(&self, set_key: &str) -> Option<u64> {
        self.sets
            .lock()
            .unwrap()
            .get(set_key)
            .and_then(|(_, expiry)| *expiry)
    }

    pub fn insert_raw(&self, key: &str, value: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_vec(), None));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn commands(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), RemoteError> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(RemoteError::connection("connection reset by peer"))
        } else {
            Ok(())
        }
    }

    /// Run `apply` against the expiry slot of `key`, whichever map holds it.
    fn with_expiry<T>(&self, key: &str, apply: impl FnOnce(&mut Option<u64>) -> T) -> Option<T> {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
            return Some(apply(&mut entry.1));
        }
        self.sets
            .lock()
            .unwrap()
            .get_mut(key)
            .map(|entry| apply(&mut entry.1))
    }
}

#[async_trait]
impl RemoteConnection for FakeRemote {
    async fn ping(&self) -> Result<(), RemoteError> {
        self.check()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(key)
            .map(|(value, _)| value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expire_seconds: Option<u64>,
    ) -> Result<(), RemoteError> {
        self.check()?;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_vec(), expire_seconds));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError> {
        self.check()?;
        let mut entries = self.entries.lock().unwrap();
        let mut sets = self.sets.lock().unwrap();
        let mut removed = 0;
        for key in keys {
            if entries.remove(key).is_some() | sets.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        self.check()?;
        Ok(self.with_expiry(key, |_| ()).is_some())
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, RemoteError> {
        self.check()?;
        Ok(self
            .with_expiry(key, |expiry| *expiry = Some(seconds))
            .is_some())
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<u64>, RemoteError> {
        self.check()?;
        Ok(self.with_expiry(key, |expiry| *expiry).unwrap_or(Some(0)))
    }

    async fn persist(&self, key: &str) -> Result<bool, RemoteError> {
        self.check()?;
        Ok(self
            .with_expiry(key, |expiry| expiry.take().is_some())
            .unwrap_or(false))
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, RemoteError> {
        self.check()?;
        let regex = glob_to_regex(pattern).map_err(|err| RemoteError::command(err.to_string()))?;
        let entries = self.entries.lock().unwrap();
        let sets = self.sets.lock().unwrap();
        Ok(entries
            .keys()
            .chain(sets.keys())
            .filter(|key| regex.is_match(key))
            .cloned()
            .collect())
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<(), RemoteError> {
        self.check()?;
        self.sets
            .lock()
            .unwrap()
            .entry(set_key.to_string())
            .or_default()
            .0
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_from_set(&self, set_key: &str, member: &str) -> Result<(), RemoteError> {
        self.check()?;
        let mut sets = self.sets.lock().unwrap();
        if let Some((members, _)) = sets.get_mut(set_key) {
            members.remove(member);
            if members.is_empty() {
                sets.remove(set_key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, RemoteError> {
        self.check()?;
        Ok(self.members_of(set_key))
    }

    async fn flush_db(&self) -> Result<(), RemoteError> {
        self.check()?;
        self.entries.lock().unwrap().clear();
        self.sets.lock().unwrap().clear();
        Ok(())
    }
}

pub struct FakeConnector {
    pub remote: Arc<FakeRemote>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(remote: Arc<FakeRemote>) -> Self {
        Self {
            remote,
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn refusing(remote: Arc<FakeRemote>) -> Self {
        let connector = Self::new(remote);
        connector.refuse.store(true, Ordering::SeqCst);
        connector
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    fn describe(&self) -> String {
        "fake://remote".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RemoteError::connection("connection refused"));
        }
        Ok(Arc::clone(&self.remote) as Arc<dyn RemoteConnection>)
    }
}

pub fn settings(max_retries: u32) -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout: Duration::from_millis(500),
        retry: RetryPolicy::new(max_retries),
    }
}

pub struct Harness {
    pub cache: Arc<CacheService>,
    pub remote: Arc<FakeRemote>,
    pub connector: Arc<FakeConnector>,
    pub manager: Arc<ConnectionManager>,
}

impl Harness {
    /// Wait until the connection reaches `state`.
    pub async fn reach(&self, state: ConnectionState) {
        let mut states = self.manager.subscribe();
        states
            .wait_for(|current| *current == state)
            .await
            .expect("connection manager alive");
    }

    /// Bring the remote back to ready, then make every command fail.
    pub async fn ready_then_failing(&self) {
        self.remote.set_failing(false);
        self.reach(ConnectionState::Ready).await;
        self.remote.set_failing(true);
    }
}

pub async fn harness_with(connector: FakeConnector, max_retries: u32) -> Harness {
    let remote = Arc::clone(&connector.remote);
    let connector = Arc::new(connector);
    let manager = ConnectionManager::new(
        Arc::clone(&connector) as Arc<dyn RemoteConnector>,
        settings(max_retries),
    );
    manager.spawn();
    manager.wait_until_settled(Duration::from_secs(1)).await;

    let config = CacheConfig::default();
    let adapter = DistributedStoreAdapter::new(Arc::clone(&manager), &config.namespace);
    let cache = Arc::new(CacheService::new(config, Some(Arc::new(adapter))));

    Harness {
        cache,
        remote,
        connector,
        manager,
    }
}

pub async fn ready_harness() -> Harness {
    harness_with(FakeConnector::new(Arc::new(FakeRemote::default())), 3).await
}
