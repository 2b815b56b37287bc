//! Connection lifecycle for the distributed store.
//!
//! A supervisor task owns connecting and reconnecting. Everything else only
//! reads the readiness flag, which lifecycle transitions keep current, so the
//! cache notices recovery on the very next operation.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lock::{rw_read, rw_write};
use super::remote::{RemoteConnection, RemoteConnector, RemoteError};

const SOURCE: &str = "cache::connection";
const METRIC_REMOTE_READY: &str = "gazette_cache_remote_ready";

const RETRY_STEP: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_millis(3000);

/// Lifecycle of the remote connection as seen by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// First attempt in flight.
    Connecting,
    Connected,
    /// Connected and answering; the only state in which the store is used.
    Ready,
    Error,
    Reconnecting,
    /// An established connection was lost.
    Closed,
    /// Retry budget spent; stays here until the process restarts.
    Exhausted,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Exhausted => "exhausted",
        }
    }
}

/// Deployment flavour; picks how patient the connection manager is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Production,
}

impl RuntimeEnvironment {
    pub fn connect_timeout(&self) -> Duration {
        match self {
            RuntimeEnvironment::Development => Duration::from_secs(2),
            RuntimeEnvironment::Production => Duration::from_secs(10),
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            RuntimeEnvironment::Development => 3,
            RuntimeEnvironment::Production => 20,
        }
    }
}

impl FromStr for RuntimeEnvironment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(RuntimeEnvironment::Development),
            "production" | "prod" => Ok(RuntimeEnvironment::Production),
            other => Err(format!(
                "unknown environment `{other}` (expected development|production)"
            )),
        }
    }
}

/// Linear backoff with a ceiling: `min(attempt * 100ms, 3000ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub step: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            step: RETRY_STEP,
            max_delay: RETRY_MAX_DELAY,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_delay)
    }

    /// Whether another attempt may follow `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ConnectionSettings {
    pub fn for_environment(environment: RuntimeEnvironment) -> Self {
        Self {
            connect_timeout: environment.connect_timeout(),
            retry: RetryPolicy::new(environment.max_retries()),
        }
    }
}

/// Tracks readiness of the remote store and supervises reconnection.
pub struct ConnectionManager {
    connector: Arc<dyn RemoteConnector>,
    settings: ConnectionSettings,
    ready: AtomicBool,
    current: RwLock<Option<Arc<dyn RemoteConnection>>>,
    state: watch::Sender<ConnectionState>,
    lost: Notify,
    attempts: AtomicU32,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn RemoteConnector>, settings: ConnectionSettings) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Arc::new(Self {
            connector,
            settings,
            ready: AtomicBool::new(false),
            current: RwLock::new(None),
            state,
            lost: Notify::new(),
            attempts: AtomicU32::new(0),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connection attempts made so far, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// The live connection, only while the store is ready.
    pub fn connection(&self) -> Option<Arc<dyn RemoteConnection>> {
        if !self.is_ready() {
            return None;
        }
        rw_read(&self.current, SOURCE, "connection").clone()
    }

    /// Inspect an operation failure; connection-class errors drop readiness
    /// and wake the supervisor.
    pub fn report_failure(&self, err: &RemoteError) {
        if err.is_connection() {
            self.mark_lost(&err.to_string());
        }
    }

    pub fn mark_lost(&self, reason: &str) {
        if self
            .ready
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            warn!(
                target = "gazette::cache::remote",
                reason, "distributed cache connection lost"
            );
            self.transition(ConnectionState::Closed);
            self.lost.notify_one();
        }
    }

    /// Wait until the first connection attempt has resolved, bounded by `timeout`.
    pub async fn wait_until_settled(&self, timeout: Duration) -> ConnectionState {
        let mut receiver = self.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(|state| *state != ConnectionState::Connecting)
                .await
                .map(|state| *state)
        })
        .await;
        match settled {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => self.state(),
            Err(_) => {
                debug!(
                    target = "gazette::cache::remote",
                    timeout_ms = timeout.as_millis() as u64,
                    "distributed cache still connecting"
                );
                self.state()
            }
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.supervise().await })
    }

    async fn supervise(self: Arc<Self>) {
        let target = self.connector.describe();
        let mut failures: u32 = 0;

        loop {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            match self.establish().await {
                Ok(connection) => {
                    failures = 0;
                    *rw_write(&self.current, SOURCE, "install") = Some(connection);
                    self.transition(ConnectionState::Connected);
                    self.transition(ConnectionState::Ready);
                    info!(
                        target = "gazette::cache::remote",
                        store = %target,
                        "distributed cache ready"
                    );

                    self.lost.notified().await;
                    *rw_write(&self.current, SOURCE, "discard") = None;
                    self.transition(ConnectionState::Reconnecting);
                    tokio::time::sleep(self.settings.retry.delay_for(1)).await;
                }
                Err(err) => {
                    failures += 1;
                    self.transition(ConnectionState::Error);
                    warn!(
                        target = "gazette::cache::remote",
                        store = %target,
                        attempt = failures,
                        error = %err,
                        "distributed cache connection failed; serving from memory"
                    );

                    if !self.settings.retry.allows_retry(failures) {
                        self.transition(ConnectionState::Exhausted);
                        error!(
                            target = "gazette::cache::remote",
                            store = %target,
                            max_retries = self.settings.retry.max_retries,
                            "distributed cache retry budget exhausted; staying on memory until restart"
                        );
                        return;
                    }

                    let delay = self.settings.retry.delay_for(failures);
                    self.transition(ConnectionState::Reconnecting);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn establish(&self) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
        let timeout = self.settings.connect_timeout;
        let attempt = async {
            let connection = self.connector.connect().await?;
            connection.ping().await?;
            Ok::<_, RemoteError>(connection)
        };

        tokio::time::timeout(timeout, attempt).await.map_err(|_| {
            RemoteError::connection(format!(
                "connect timed out after {}ms",
                timeout.as_millis()
            ))
        })?
    }

    fn transition(&self, next: ConnectionState) {
        let ready = next == ConnectionState::Ready;
        self.ready.store(ready, Ordering::Release);
        self.state.send_replace(next);
        gauge!(METRIC_REMOTE_READY).set(if ready { 1.0 } else { 0.0 });
        debug!(
            target = "gazette::cache::remote",
            state = next.as_str(),
            "connection state changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;

    struct NullConnection;

    #[async_trait]
    impl RemoteConnection for NullConnection {
        async fn ping(&self) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
            Ok(None)
        }
        async fn set(&self, _: &str, _: &[u8], _: Option<u64>) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn del(&self, _keys: &[String]) -> Result<u64, RemoteError> {
            Ok(0)
        }
        async fn exists(&self, _key: &str) -> Result<bool, RemoteError> {
            Ok(false)
        }
        async fn expire(&self, _key: &str, _seconds: u64) -> Result<bool, RemoteError> {
            Ok(false)
        }
        async fn time_to_live(&self, _key: &str) -> Result<Option<u64>, RemoteError> {
            Ok(Some(0))
        }
        async fn persist(&self, _key: &str) -> Result<bool, RemoteError> {
            Ok(false)
        }
        async fn scan_match(&self, _pattern: &str) -> Result<Vec<String>, RemoteError> {
            Ok(Vec::new())
        }
        async fn add_to_set(&self, _: &str, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn remove_from_set(&self, _: &str, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn set_members(&self, _set_key: &str) -> Result<Vec<String>, RemoteError> {
            Ok(Vec::new())
        }
        async fn flush_db(&self) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    /// Fails the first `failures` connects, then succeeds.
    struct FlakyConnector {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RemoteConnector for FlakyConnector {
        fn describe(&self) -> String {
            "flaky".to_string()
        }

        async fn connect(&self) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(RemoteError::connection("refused"))
            } else {
                Ok(Arc::new(NullConnection))
            }
        }
    }

    /// Never answers; attempts only end through the connect timeout.
    struct StalledConnector;

    #[async_trait]
    impl RemoteConnector for StalledConnector {
        fn describe(&self) -> String {
            "stalled".to_string()
        }

        async fn connect(&self) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
            std::future::pending().await
        }
    }

    fn settings(max_retries: u32) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(500),
            retry: RetryPolicy::new(max_retries),
        }
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(7), Duration::from_millis(700));
        assert_eq!(policy.delay_for(30), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(3000));
    }

    #[test]
    fn development_fails_faster_than_production() {
        let dev = ConnectionSettings::for_environment(RuntimeEnvironment::Development);
        let prod = ConnectionSettings::for_environment(RuntimeEnvironment::Production);
        assert!(dev.connect_timeout < prod.connect_timeout);
        assert!(dev.retry.max_retries < prod.retry.max_retries);
    }

    #[test]
    fn environment_parses_aliases() {
        assert_eq!(
            "prod".parse::<RuntimeEnvironment>(),
            Ok(RuntimeEnvironment::Production)
        );
        assert!("staging".parse::<RuntimeEnvironment>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_retry_budget() {
        let connector = Arc::new(FlakyConnector {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(connector.clone(), settings(2));
        let handle = manager.spawn();
        handle.await.expect("supervisor exits once exhausted");

        assert_eq!(manager.state(), ConnectionState::Exhausted);
        assert!(!manager.is_ready());
        assert_eq!(manager.attempts(), 3);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert!(manager.connection().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let connector = Arc::new(FlakyConnector {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(connector, settings(5));
        let handle = manager.spawn();

        let mut states = manager.subscribe();
        states
            .wait_for(|state| *state == ConnectionState::Ready)
            .await
            .expect("manager alive");
        assert!(manager.is_ready());
        assert!(manager.connection().is_some());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_reconnects() {
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(connector.clone(), settings(3));
        let handle = manager.spawn();

        let mut states = manager.subscribe();
        states
            .wait_for(|state| *state == ConnectionState::Ready)
            .await
            .expect("manager alive");

        manager.report_failure(&RemoteError::connection("reset by peer"));
        assert!(!manager.is_ready());

        states
            .wait_for(|state| *state == ConnectionState::Ready)
            .await
            .expect("manager alive");
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn command_errors_keep_the_connection() {
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(connector, settings(3));
        let handle = manager.spawn();
        manager
            .wait_until_settled(Duration::from_secs(1))
            .await;

        manager.report_failure(&RemoteError::command("WRONGTYPE"));
        assert!(manager.is_ready());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn settling_reports_the_first_outcome() {
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(connector, settings(3));
        let handle = manager.spawn();

        let state = manager.wait_until_settled(Duration::from_secs(1)).await;
        assert_eq!(state, ConnectionState::Ready);
        assert_eq!(manager.state(), ConnectionState::Ready);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn settling_gives_up_while_still_connecting() {
        let manager = ConnectionManager::new(Arc::new(StalledConnector), settings(3));
        let handle = manager.spawn();

        let state = manager
            .wait_until_settled(Duration::from_millis(100))
            .await;
        assert_eq!(state, ConnectionState::Connecting);

        handle.abort();
    }
}
