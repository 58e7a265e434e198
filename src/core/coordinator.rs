//! Polling coordinator: runs one fetch-aggregate-publish cycle at a time,
//! on a fixed interval and on demand.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::aggregate::{aggregate_by_key, aggregate_by_model};
use crate::core::client::{as_int, ManagementApi};
use crate::core::error::{ApiError, FailureReason};
use crate::core::models::settings::{SettingKey, SettingValue, Settings};
use crate::core::models::snapshot::{DiagnosticsEnabled, LogsSection, Snapshot};
use crate::core::models::usage::UsageResponse;

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 30;
pub const MIN_POLL_INTERVAL_SECONDS: u64 = 5;
pub const MAX_POLL_INTERVAL_SECONDS: u64 = 300;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub poll_interval: Duration,
    pub log_diagnostics: bool,
    pub request_error_logs: bool,
}

impl CoordinatorOptions {
    pub fn new(poll_interval_seconds: u64, log_diagnostics: bool, request_error_logs: bool) -> Self {
        Self {
            poll_interval: Duration::from_secs(clamp_poll_interval(poll_interval_seconds)),
            log_diagnostics,
            request_error_logs,
        }
    }

    fn diagnostics(&self) -> DiagnosticsEnabled {
        DiagnosticsEnabled {
            log_diagnostics: self.log_diagnostics,
            request_error_logs: self.request_error_logs,
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL_SECONDS, false, false)
    }
}

pub fn clamp_poll_interval(seconds: u64) -> u64 {
    seconds.clamp(MIN_POLL_INTERVAL_SECONDS, MAX_POLL_INTERVAL_SECONDS)
}

/// Watermark of the last log line pulled. Never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCursor {
    last_log_timestamp: i64,
}

impl LogCursor {
    pub fn value(&self) -> i64 {
        self.last_log_timestamp
    }

    fn advance(&mut self, timestamp: i64) {
        if timestamp > self.last_log_timestamp {
            self.last_log_timestamp = timestamp;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl From<&ApiError> for UpdateFailure {
    fn from(err: &ApiError) -> Self {
        Self {
            reason: err.reason(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for UpdateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.reason)
    }
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Updated(Arc<Snapshot>),
    UpdateFailed(UpdateFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Fetching,
    Published,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub phase: CyclePhase,
    pub last_update_success: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure: Option<UpdateFailure>,
    pub cycles_completed: u64,
}

impl Default for CoordinatorStatus {
    fn default() -> Self {
        Self {
            phase: CyclePhase::Idle,
            last_update_success: false,
            last_success_at: None,
            last_failure: None,
            cycles_completed: 0,
        }
    }
}

pub struct Coordinator {
    api: Arc<dyn ManagementApi>,
    options: CoordinatorOptions,
    /// Held for the whole cycle; owning the cursor makes cycles single-flight.
    cursor: Mutex<LogCursor>,
    snapshot: watch::Sender<Option<Arc<Snapshot>>>,
    status: watch::Sender<CoordinatorStatus>,
    events: broadcast::Sender<CoordinatorEvent>,
    refresh_requested: Notify,
    cycles_started: AtomicU64,
    /// `true` while a spawned poller owns the cycle schedule.
    poller_running: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(api: Arc<dyn ManagementApi>, options: CoordinatorOptions) -> Arc<Self> {
        let (snapshot, _) = watch::channel(None);
        let (status, _) = watch::channel(CoordinatorStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (poller_running, _) = watch::channel(false);
        Arc::new(Self {
            api,
            options,
            cursor: Mutex::new(LogCursor::default()),
            snapshot,
            status,
            events,
            refresh_requested: Notify::new(),
            cycles_started: AtomicU64::new(0),
            poller_running,
        })
    }

    /// Latest published snapshot, if any cycle has succeeded yet.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    /// Register an observer for update and failure notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Run one cycle immediately and report its outcome.
    pub async fn first_refresh(&self) -> Result<Arc<Snapshot>, UpdateFailure> {
        self.execute_cycle().await
    }

    /// Ask for a cycle soon. Requests made while a cycle is running collapse
    /// into a single follow-up cycle.
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Wait for a cycle that starts after this call and return the latest
    /// outcome. Without a running poller the cycle runs inline. If the poller
    /// stops before that cycle completes, the wait ends with a failure.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, UpdateFailure> {
        let mut running_rx = self.poller_running.subscribe();
        if !*running_rx.borrow_and_update() {
            return self.execute_cycle().await;
        }

        let target = self.cycles_started.load(Ordering::SeqCst) + 1;
        let mut status_rx = self.status.subscribe();
        self.request_refresh();
        let completed = tokio::select! {
            biased;
            status = status_rx.wait_for(|status| status.cycles_completed >= target) => {
                status.map(|status| status.clone()).ok()
            }
            _ = running_rx.wait_for(|running| !*running) => None,
        };
        let status = completed.ok_or_else(|| UpdateFailure {
            reason: FailureReason::Other,
            message: "coordinator stopped".to_string(),
        })?;

        if status.last_update_success {
            if let Some(snapshot) = self.snapshot() {
                return Ok(snapshot);
            }
        }
        Err(status.last_failure.unwrap_or(UpdateFailure {
            reason: FailureReason::Other,
            message: "no snapshot published".to_string(),
        }))
    }

    /// Write one setting to the remote, then schedule a refresh.
    pub async fn write_setting(&self, key: SettingKey, value: SettingValue) -> Result<(), ApiError> {
        self.api.set_setting(key, value).await?;
        info!(setting = key.id(), %value, "setting written");
        self.request_refresh();
        Ok(())
    }

    /// Clear remote logs, then schedule a refresh.
    pub async fn clear_logs(&self) -> Result<(), ApiError> {
        self.api.clear_logs().await?;
        info!("remote logs cleared");
        self.request_refresh();
        Ok(())
    }

    /// Start the periodic poller. Dropping or stopping the handle ends it;
    /// an in-flight cycle is abandoned without publishing.
    pub fn spawn(self: &Arc<Self>) -> PollerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);
        coordinator.poller_running.send_replace(true);

        let task = tokio::spawn(async move {
            info!(
                interval_secs = coordinator.options.poll_interval.as_secs(),
                "poller started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(coordinator.options.poll_interval) => {
                        debug!("poll interval elapsed");
                    }
                    _ = coordinator.refresh_requested.notified() => {
                        debug!("on-demand refresh");
                    }
                    _ = shutdown_rx.changed() => break,
                }

                tokio::select! {
                    _ = coordinator.execute_cycle() => {}
                    _ = shutdown_rx.changed() => {
                        debug!("abandoning in-flight cycle");
                        coordinator.status.send_modify(|status| {
                            if status.phase == CyclePhase::Fetching {
                                status.phase = CyclePhase::Idle;
                            }
                        });
                        break;
                    }
                }
            }
            coordinator.poller_running.send_replace(false);
            info!("poller stopped");
        });

        PollerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn execute_cycle(&self) -> Result<Arc<Snapshot>, UpdateFailure> {
        let mut cursor = self.cursor.lock().await;
        let cycle = self.cycles_started.fetch_add(1, Ordering::SeqCst) + 1;
        self.status
            .send_modify(|status| status.phase = CyclePhase::Fetching);
        debug!(cycle, "cycle started");

        // The cursor is committed only together with a published snapshot.
        let mut next_cursor = *cursor;
        let outcome = self.collect(&mut next_cursor).await;

        match outcome {
            Ok(snapshot) => {
                *cursor = next_cursor;
                let snapshot = Arc::new(snapshot);
                self.snapshot.send_replace(Some(Arc::clone(&snapshot)));
                self.status.send_modify(|status| {
                    status.phase = CyclePhase::Published;
                    status.last_update_success = true;
                    status.last_success_at = snapshot.fetched_at;
                    status.cycles_completed = cycle;
                });
                let _ = self.events.send(CoordinatorEvent::Updated(Arc::clone(&snapshot)));
                info!(
                    cycle,
                    keys = snapshot.key_usage.len(),
                    models = snapshot.model_token_usage.len(),
                    "snapshot published"
                );
                Ok(snapshot)
            }
            Err(err) => {
                let failure = UpdateFailure::from(&err);
                self.status.send_modify(|status| {
                    status.phase = CyclePhase::Failed;
                    status.last_update_success = false;
                    status.last_failure = Some(failure.clone());
                    status.cycles_completed = cycle;
                });
                let _ = self.events.send(CoordinatorEvent::UpdateFailed(failure.clone()));
                warn!(cycle, reason = %failure.reason, "update failed: {}", failure.message);
                Err(failure)
            }
        }
    }

    async fn collect(&self, cursor: &mut LogCursor) -> Result<Snapshot, ApiError> {
        let usage = UsageResponse::from_payload(&self.api.get_usage().await?);
        let key_usage = aggregate_by_key(&usage.document);
        let model_token_usage = aggregate_by_model(&usage.document);

        let mut settings = Settings::default();
        for key in SettingKey::all() {
            let value = self.api.get_setting(*key).await?;
            settings.set(*key, value);
        }

        let latest_version = latest_version(&self.api.get_latest_version().await?);

        let logs = if self.options.log_diagnostics && settings.logging_to_file {
            self.pull_logs(cursor).await
        } else {
            LogsSection::empty(cursor.value())
        };

        let request_error_logs = if self.options.request_error_logs {
            self.pull_request_error_logs().await
        } else {
            Vec::new()
        };

        Ok(Snapshot {
            usage: usage.raw,
            failed_requests: usage.failed_requests,
            key_usage,
            model_token_usage,
            settings,
            latest_version,
            logs,
            request_error_logs,
            diagnostics_enabled: self.options.diagnostics(),
            fetched_at: Some(Utc::now()),
        })
    }

    async fn pull_logs(&self, cursor: &mut LogCursor) -> LogsSection {
        let payload = match self.api.get_logs(cursor.value()).await {
            Ok(payload) => payload,
            Err(err) => {
                debug!(error = %err, "skipping logs pull");
                return LogsSection::empty(cursor.value());
            }
        };

        if let Some(timestamp) = payload.get("latest-timestamp").and_then(as_int) {
            cursor.advance(timestamp);
        }
        let lines: Vec<String> = match payload.get("lines") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|line| match line {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };
        let line_count = payload
            .get("line-count")
            .and_then(as_int)
            .unwrap_or(lines.len() as i64);

        LogsSection {
            lines,
            line_count,
            latest_timestamp: cursor.value(),
        }
    }

    async fn pull_request_error_logs(&self) -> Vec<Value> {
        match self.api.get_request_error_logs().await {
            Ok(payload) => match payload.get("files") {
                Some(Value::Array(files)) => files.clone(),
                _ => Vec::new(),
            },
            Err(err) => {
                debug!(error = %err, "skipping request-error-logs pull");
                Vec::new()
            }
        }
    }
}

fn latest_version(payload: &Map<String, Value>) -> Option<String> {
    match payload.get("latest-version")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Handle to a running poller.
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    #[derive(Debug, Clone, Copy)]
    enum Fail {
        Auth,
        Connection,
        Status(u16),
    }

    impl Fail {
        fn error(self) -> ApiError {
            match self {
                Fail::Auth => ApiError::Authentication("invalid management key".into()),
                Fail::Connection => ApiError::Connection("connection refused".into()),
                Fail::Status(status) => ApiError::Request {
                    status,
                    message: "boom".into(),
                },
            }
        }
    }

    #[derive(Default)]
    struct FakeApi {
        usage: std::sync::Mutex<Value>,
        settings: std::sync::Mutex<Settings>,
        fail_usage: std::sync::Mutex<Option<Fail>>,
        fail_setting: std::sync::Mutex<Option<(SettingKey, Fail)>>,
        fail_version: std::sync::Mutex<Option<Fail>>,
        log_pages: std::sync::Mutex<VecDeque<Result<Value, Fail>>>,
        log_afters: std::sync::Mutex<Vec<i64>>,
        error_logs: std::sync::Mutex<Option<Result<Value, Fail>>>,
        writes: std::sync::Mutex<Vec<(SettingKey, SettingValue)>>,
        usage_calls: AtomicUsize,
        error_log_calls: AtomicUsize,
        clears: AtomicUsize,
        gate: Option<Semaphore>,
    }

    impl FakeApi {
        fn new() -> Self {
            let api = Self::default();
            *api.usage.lock().unwrap() = json!({
                "failed_requests": 1,
                "usage": {
                    "total_requests": 2,
                    "failure_count": 1,
                    "apis": { "a": { "models": { "m": { "details": [
                        { "auth_index": "k1", "tokens": { "total_tokens": 10, "input_tokens": 7, "output_tokens": 3, "cached_tokens": 0 }, "failed": false },
                        { "auth_index": "k1", "tokens": { "total_tokens": 4 }, "failed": true }
                    ] } } } }
                }
            });
            api
        }

        fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::new()
            }
        }

        fn with_logging_to_file(self) -> Self {
            self.settings.lock().unwrap().logging_to_file = true;
            self
        }

        fn push_log_page(&self, page: Result<Value, Fail>) {
            self.log_pages.lock().unwrap().push_back(page);
        }
    }

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[async_trait]
    impl ManagementApi for FakeApi {
        async fn get_usage(&self) -> Result<Map<String, Value>, ApiError> {
            self.usage_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if let Some(fail) = *self.fail_usage.lock().unwrap() {
                return Err(fail.error());
            }
            Ok(as_map(self.usage.lock().unwrap().clone()))
        }

        async fn get_latest_version(&self) -> Result<Map<String, Value>, ApiError> {
            if let Some(fail) = *self.fail_version.lock().unwrap() {
                return Err(fail.error());
            }
            Ok(as_map(json!({ "latest-version": "v6.1.0" })))
        }

        async fn get_setting(&self, key: SettingKey) -> Result<SettingValue, ApiError> {
            if let Some((failing, fail)) = *self.fail_setting.lock().unwrap() {
                if failing == key {
                    return Err(fail.error());
                }
            }
            Ok(self.settings.lock().unwrap().get(key))
        }

        async fn set_setting(&self, key: SettingKey, value: SettingValue) -> Result<(), ApiError> {
            self.writes.lock().unwrap().push((key, value));
            self.settings.lock().unwrap().set(key, value);
            Ok(())
        }

        async fn get_logs(&self, after: i64) -> Result<Map<String, Value>, ApiError> {
            self.log_afters.lock().unwrap().push(after);
            match self.log_pages.lock().unwrap().pop_front() {
                Some(Ok(page)) => Ok(as_map(page)),
                Some(Err(fail)) => Err(fail.error()),
                None => Ok(as_map(json!({ "lines": [], "line-count": 0 }))),
            }
        }

        async fn clear_logs(&self) -> Result<Map<String, Value>, ApiError> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            Ok(Map::new())
        }

        async fn get_request_error_logs(&self) -> Result<Map<String, Value>, ApiError> {
            self.error_log_calls.fetch_add(1, Ordering::SeqCst);
            match self.error_logs.lock().unwrap().clone() {
                Some(Ok(value)) => Ok(as_map(value)),
                Some(Err(fail)) => Err(fail.error()),
                None => Ok(as_map(json!({ "files": [] }))),
            }
        }
    }

    fn coordinator(api: &Arc<FakeApi>, log_diagnostics: bool, error_logs: bool) -> Arc<Coordinator> {
        let api: Arc<dyn ManagementApi> = api.clone();
        Coordinator::new(
            api,
            CoordinatorOptions::new(MAX_POLL_INTERVAL_SECONDS, log_diagnostics, error_logs),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "condition not reached in time");
    }

    #[test]
    fn poll_interval_is_clamped() {
        assert_eq!(clamp_poll_interval(1), 5);
        assert_eq!(clamp_poll_interval(30), 30);
        assert_eq!(clamp_poll_interval(3600), 300);
        assert_eq!(
            CoordinatorOptions::default().poll_interval,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn cursor_never_regresses() {
        let mut cursor = LogCursor::default();
        cursor.advance(10);
        cursor.advance(3);
        assert_eq!(cursor.value(), 10);
        cursor.advance(11);
        assert_eq!(cursor.value(), 11);
    }

    #[test]
    fn latest_version_shapes() {
        assert_eq!(
            latest_version(&as_map(json!({ "latest-version": "v1" }))),
            Some("v1".to_string())
        );
        assert_eq!(latest_version(&as_map(json!({ "latest-version": null }))), None);
        assert_eq!(latest_version(&Map::new()), None);
        assert_eq!(
            latest_version(&as_map(json!({ "latest-version": 7 }))),
            Some("7".to_string())
        );
    }

    #[tokio::test]
    async fn successful_cycle_publishes_snapshot() {
        let api = Arc::new(FakeApi::new());
        let coordinator = coordinator(&api, false, false);
        let mut events = coordinator.subscribe();

        let snapshot = coordinator.first_refresh().await.unwrap();
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.key_usage["k1"].requests, 2);
        assert_eq!(snapshot.key_usage["k1"].failed, 1);
        assert_eq!(snapshot.key_usage["k1"].tokens, 14);
        assert_eq!(snapshot.model_token_usage["m"].requests, 2);
        assert_eq!(snapshot.latest_version.as_deref(), Some("v6.1.0"));
        assert_eq!(snapshot.usage["total_requests"], json!(2));
        assert!(snapshot.fetched_at.is_some());

        match events.try_recv() {
            Ok(CoordinatorEvent::Updated(published)) => assert!(Arc::ptr_eq(&published, &snapshot)),
            other => panic!("expected update event, got {:?}", other),
        }
        assert!(events.try_recv().is_err());

        let status = coordinator.status();
        assert_eq!(status.phase, CyclePhase::Published);
        assert!(status.last_update_success);
        assert_eq!(status.cycles_completed, 1);
    }

    #[tokio::test]
    async fn auth_failure_keeps_previous_snapshot() {
        let api = Arc::new(FakeApi::new());
        let coordinator = coordinator(&api, false, false);
        let previous = coordinator.first_refresh().await.unwrap();

        *api.fail_usage.lock().unwrap() = Some(Fail::Auth);
        let mut events = coordinator.subscribe();
        let failure = coordinator.first_refresh().await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::Authentication);

        let current = coordinator.snapshot().unwrap();
        assert!(Arc::ptr_eq(&previous, &current));

        match events.try_recv() {
            Ok(CoordinatorEvent::UpdateFailed(f)) => {
                assert_eq!(f.reason, FailureReason::Authentication);
                assert!(f.message.contains("invalid management key"));
            }
            other => panic!("expected failure event, got {:?}", other),
        }
        assert!(events.try_recv().is_err());

        let status = coordinator.status();
        assert_eq!(status.phase, CyclePhase::Failed);
        assert!(!status.last_update_success);
    }

    #[tokio::test]
    async fn any_setting_failure_is_fatal() {
        let api = Arc::new(FakeApi::new());
        *api.fail_setting.lock().unwrap() = Some((SettingKey::MaxRetryInterval, Fail::Connection));
        let coordinator = coordinator(&api, false, false);

        let failure = coordinator.first_refresh().await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::Connection);
        assert!(coordinator.snapshot().is_none());
    }

    #[tokio::test]
    async fn version_failure_is_classified_other() {
        let api = Arc::new(FakeApi::new());
        *api.fail_version.lock().unwrap() = Some(Fail::Status(500));
        let coordinator = coordinator(&api, false, false);

        let failure = coordinator.first_refresh().await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::Other);
        assert_eq!(failure.message, "Request failed (500): boom");
    }

    #[tokio::test]
    async fn disabled_log_diagnostics_keeps_cursor() {
        let api = Arc::new(FakeApi::new().with_logging_to_file());
        let coordinator = coordinator(&api, false, false);

        for _ in 0..2 {
            let snapshot = coordinator.first_refresh().await.unwrap();
            assert_eq!(snapshot.logs.line_count, 0);
            assert_eq!(snapshot.logs.latest_timestamp, 0);
            assert!(snapshot.logs.lines.is_empty());
        }
        assert!(api.log_afters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn logs_require_logging_to_file() {
        let api = Arc::new(FakeApi::new());
        let coordinator = coordinator(&api, true, false);

        let snapshot = coordinator.first_refresh().await.unwrap();
        assert_eq!(snapshot.logs, LogsSection::empty(0));
        assert!(api.log_afters.lock().unwrap().is_empty());
        assert!(snapshot.diagnostics_enabled.log_diagnostics);
    }

    #[tokio::test]
    async fn log_cursor_is_monotonic() {
        let api = Arc::new(FakeApi::new().with_logging_to_file());
        api.push_log_page(Ok(json!({ "lines": ["a", "b"], "line-count": 2, "latest-timestamp": 100 })));
        api.push_log_page(Ok(json!({ "lines": ["c"], "line-count": 1, "latest-timestamp": 50 })));
        api.push_log_page(Ok(json!({ "lines": ["d"], "latest-timestamp": 200 })));
        let coordinator = coordinator(&api, true, false);

        let first = coordinator.first_refresh().await.unwrap();
        assert_eq!(first.logs.lines, vec!["a", "b"]);
        assert_eq!(first.logs.latest_timestamp, 100);

        let second = coordinator.first_refresh().await.unwrap();
        assert_eq!(second.logs.line_count, 1);
        assert_eq!(second.logs.latest_timestamp, 100);

        let third = coordinator.first_refresh().await.unwrap();
        assert_eq!(third.logs.line_count, 1);
        assert_eq!(third.logs.latest_timestamp, 200);

        assert_eq!(*api.log_afters.lock().unwrap(), vec![0, 100, 100]);
    }

    #[tokio::test]
    async fn log_failure_is_not_fatal() {
        let api = Arc::new(FakeApi::new().with_logging_to_file());
        api.push_log_page(Ok(json!({ "lines": ["a"], "line-count": 1, "latest-timestamp": 42 })));
        api.push_log_page(Err(Fail::Status(500)));
        let coordinator = coordinator(&api, true, false);
        coordinator.first_refresh().await.unwrap();

        let snapshot = coordinator.first_refresh().await.unwrap();
        assert_eq!(snapshot.logs, LogsSection::empty(42));
        assert!(coordinator.status().last_update_success);
    }

    #[tokio::test]
    async fn failed_cycle_leaves_cursor_alone() {
        let api = Arc::new(FakeApi::new().with_logging_to_file());
        api.push_log_page(Ok(json!({ "lines": ["a"], "latest-timestamp": 10 })));
        let coordinator = coordinator(&api, true, false);
        coordinator.first_refresh().await.unwrap();

        *api.fail_version.lock().unwrap() = Some(Fail::Connection);
        coordinator.first_refresh().await.unwrap_err();
        *api.fail_version.lock().unwrap() = None;

        api.push_log_page(Ok(json!({ "lines": [], "latest-timestamp": 11 })));
        coordinator.first_refresh().await.unwrap();
        assert_eq!(*api.log_afters.lock().unwrap(), vec![0, 10]);
    }

    #[tokio::test]
    async fn request_error_logs_follow_flag() {
        let api = Arc::new(FakeApi::new());
        *api.error_logs.lock().unwrap() = Some(Ok(json!({ "files": [{ "name": "error-1.log", "size": 12 }] })));

        let disabled = coordinator(&api, false, false);
        let snapshot = disabled.first_refresh().await.unwrap();
        assert!(snapshot.request_error_logs.is_empty());
        assert_eq!(api.error_log_calls.load(Ordering::SeqCst), 0);

        let enabled = coordinator(&api, false, true);
        let snapshot = enabled.first_refresh().await.unwrap();
        assert_eq!(snapshot.request_error_logs.len(), 1);
        assert_eq!(snapshot.request_error_logs[0]["name"], json!("error-1.log"));

        *api.error_logs.lock().unwrap() = Some(Err(Fail::Auth));
        let snapshot = enabled.first_refresh().await.unwrap();
        assert!(snapshot.request_error_logs.is_empty());
    }

    #[tokio::test]
    async fn refreshes_during_cycle_coalesce_into_one() {
        let api = Arc::new(FakeApi::gated());
        let coordinator = coordinator(&api, false, false);
        let poller = coordinator.spawn();

        coordinator.request_refresh();
        wait_until(|| api.usage_calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(coordinator.status().phase, CyclePhase::Fetching);

        coordinator.request_refresh();
        coordinator.request_refresh();
        api.gate.as_ref().unwrap().add_permits(100);

        wait_until(|| coordinator.status().cycles_completed == 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(api.usage_calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.status().cycles_completed, 2);

        poller.stop().await;
    }

    #[tokio::test]
    async fn refresh_waits_for_running_poller() {
        let api = Arc::new(FakeApi::new());
        let coordinator = coordinator(&api, false, false);
        let poller = coordinator.spawn();

        let snapshot = coordinator.refresh().await.unwrap();
        assert_eq!(snapshot.key_usage["k1"].requests, 2);
        assert_eq!(coordinator.status().cycles_completed, 1);

        poller.stop().await;
    }

    #[tokio::test]
    async fn write_setting_goes_to_remote_then_refreshes() {
        let api = Arc::new(FakeApi::new());
        let coordinator = coordinator(&api, false, false);
        let poller = coordinator.spawn();

        coordinator
            .write_setting(SettingKey::Debug, SettingValue::Bool(true))
            .await
            .unwrap();
        assert_eq!(
            *api.writes.lock().unwrap(),
            vec![(SettingKey::Debug, SettingValue::Bool(true))]
        );

        wait_until(|| coordinator.status().cycles_completed >= 1).await;
        assert!(coordinator.snapshot().unwrap().settings.debug);

        poller.stop().await;
    }

    #[tokio::test]
    async fn clear_logs_goes_to_remote() {
        let api = Arc::new(FakeApi::new());
        let coordinator = coordinator(&api, false, false);

        coordinator.clear_logs().await.unwrap();
        assert_eq!(api.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stopping_abandons_in_flight_cycle() {
        let api = Arc::new(FakeApi::gated());
        let coordinator = coordinator(&api, false, false);
        let poller = coordinator.spawn();

        coordinator.request_refresh();
        wait_until(|| api.usage_calls.load(Ordering::SeqCst) == 1).await;
        poller.stop().await;

        assert!(coordinator.snapshot().is_none());
        assert_eq!(coordinator.status().phase, CyclePhase::Idle);
        assert_eq!(coordinator.status().cycles_completed, 0);
    }

    #[tokio::test]
    async fn refresh_returns_when_poller_stops() {
        let api = Arc::new(FakeApi::gated());
        let coordinator = coordinator(&api, false, false);
        let poller = coordinator.spawn();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.refresh().await })
        };
        wait_until(|| api.usage_calls.load(Ordering::SeqCst) == 1).await;
        poller.stop().await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("refresh still waiting after the poller stopped")
            .unwrap();
        let failure = outcome.unwrap_err();
        assert_eq!(failure.reason, FailureReason::Other);
        assert_eq!(failure.message, "coordinator stopped");
    }
}
