use crate::stream::policy::{RetryDecision, RetryPolicy, ScheduledRetry};
use crate::stream::transport::{EventSink, Transport, TransportEvent, TransportHandle};
use crate::stream::types::{CloseInfo, ConnectionKey, ReadyState, StreamCallbacks};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;

struct CallbackSlot {
    callbacks: Option<Arc<StreamCallbacks>>,
    /// `Some` until the entry is registered.
    deferred: Option<Vec<TransportEvent>>,
}

/// Events are dispatched while holding the gate, so once `detach` returns no
/// further event reaches the caller.
pub(crate) struct DispatchGate {
    slot: ReentrantMutex<RefCell<CallbackSlot>>,
}

impl DispatchGate {
    fn new(callbacks: Arc<StreamCallbacks>) -> Self {
        Self {
            slot: ReentrantMutex::new(RefCell::new(CallbackSlot {
                callbacks: Some(callbacks),
                deferred: Some(Vec::new()),
            })),
        }
    }

    fn hold(&self) -> ReentrantMutexGuard<'_, RefCell<CallbackSlot>> {
        self.slot.lock()
    }

    fn detach(&self) {
        let guard = self.slot.lock();
        let mut slot = guard.borrow_mut();
        slot.callbacks = None;
        slot.deferred = None;
    }
}

struct PendingRetry {
    id: u64,
    schedule: ScheduledRetry,
    task: AbortHandle,
}

struct ManagedConnection {
    target: String,
    callbacks: Arc<StreamCallbacks>,
    policy: RetryPolicy,
    generation: u64,
    gate: Arc<DispatchGate>,
    /// `None` while waiting for a scheduled retry.
    transport: Option<Arc<dyn TransportHandle>>,
    attempt_count: u32,
    pending_retry: Option<PendingRetry>,
}

pub(crate) struct RegistryShared {
    transport: Arc<dyn Transport>,
    entries: Mutex<HashMap<ConnectionKey, ManagedConnection>>,
    next_id: AtomicU64,
}

impl RegistryShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct OpenRequest {
    target: String,
    key: ConnectionKey,
    callbacks: Arc<StreamCallbacks>,
    policy: RetryPolicy,
    attempt_count: u32,
    replaces: Option<u64>,
}

#[derive(Clone)]
pub struct StreamHandle {
    key: ConnectionKey,
    generation: u64,
    transport: Arc<dyn TransportHandle>,
}

impl StreamHandle {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn ready_state(&self) -> ReadyState {
        self.transport.ready_state()
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub key: ConnectionKey,
    /// `None` while waiting for a scheduled retry.
    pub state: Option<ReadyState>,
    pub attempt_count: u32,
    pub retry_attempt: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

/// Owns every live market-data connection, at most one per key.
#[derive(Clone)]
pub struct StreamRegistry {
    shared: Arc<RegistryShared>,
}

impl StreamRegistry {
    pub fn new(transport: impl Transport) -> Self {
        Self::with_transport(Arc::new(transport))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                transport,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Opens `target` under `key`, closing whatever was registered for `key`
    /// first. Returns `None` when the transport cannot be constructed.
    pub fn connect(
        &self,
        target: &str,
        key: ConnectionKey,
        callbacks: Arc<StreamCallbacks>,
        policy: RetryPolicy,
    ) -> Option<StreamHandle> {
        self.close(key.as_str());
        tracing::info!(key = %key, target, "creating stream connection");
        self.establish(OpenRequest {
            target: target.to_string(),
            key,
            callbacks,
            policy,
            attempt_count: 0,
            replaces: None,
        })
    }

    pub fn get(&self, key: &str) -> Option<StreamHandle> {
        let entries = self.shared.entries.lock();
        let (key, entry) = entries.get_key_value(key)?;
        let transport = entry.transport.as_ref()?;
        Some(StreamHandle {
            key: key.clone(),
            generation: entry.generation,
            transport: Arc::clone(transport),
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.shared
            .entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.transport.is_some())
    }

    /// Keys with a live transport. Keys waiting for a retry are not listed.
    pub fn list_keys(&self) -> Vec<ConnectionKey> {
        self.shared
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.transport.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn state(&self, key: &str) -> Option<ReadyState> {
        let transport = self
            .shared
            .entries
            .lock()
            .get(key)
            .and_then(|entry| entry.transport.clone())?;
        Some(transport.ready_state())
    }

    pub fn attempt_count(&self, key: &str) -> Option<u32> {
        self.shared
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.attempt_count)
    }

    pub fn pending_retry(&self, key: &str) -> Option<ScheduledRetry> {
        self.shared
            .entries
            .lock()
            .get(key)
            .and_then(|entry| entry.pending_retry.as_ref().map(|retry| retry.schedule))
    }

    pub fn status(&self, key: &str) -> Option<StreamStatus> {
        let entries = self.shared.entries.lock();
        let (key, entry) = entries.get_key_value(key)?;
        let retry = entry.pending_retry.as_ref().map(|retry| retry.schedule);
        Some(StreamStatus {
            key: key.clone(),
            state: entry.transport.as_ref().map(|transport| transport.ready_state()),
            attempt_count: entry.attempt_count,
            retry_attempt: retry.map(|retry| retry.attempt),
            retry_delay_ms: retry.map(|retry| retry.delay.as_millis() as u64),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().is_empty()
    }

    pub fn close(&self, key: &str) {
        let removed = self.shared.entries.lock().remove(key);
        if let Some(record) = removed {
            teardown(key, record);
        }
    }

    /// Closes the connection only if `handle` still refers to it.
    pub fn close_handle(&self, handle: &StreamHandle) -> bool {
        let removed = {
            let mut entries = self.shared.entries.lock();
            let current = entries
                .get(handle.key.as_str())
                .is_some_and(|entry| entry.generation == handle.generation);
            if current {
                entries.remove(handle.key.as_str())
            } else {
                None
            }
        };

        match removed {
            Some(record) => {
                teardown(handle.key.as_str(), record);
                true
            }
            None => false,
        }
    }

    /// Includes keys waiting for a retry. Returns how many keys were closed.
    pub fn close_by_prefix(&self, prefix: &str, keep: Option<&str>) -> usize {
        let keys: Vec<ConnectionKey> = self
            .shared
            .entries
            .lock()
            .keys()
            .filter(|key| key.has_prefix(prefix) && keep != Some(key.as_str()))
            .cloned()
            .collect();

        for key in &keys {
            tracing::debug!(prefix, key = %key, "closing stream by prefix");
            self.close(key.as_str());
        }
        keys.len()
    }

    pub fn close_all(&self) {
        let drained: Vec<(ConnectionKey, ManagedConnection)> =
            self.shared.entries.lock().drain().collect();
        tracing::info!(count = drained.len(), "closing all stream connections");

        for (key, record) in drained {
            teardown(key.as_str(), record);
        }
    }

    fn establish(&self, request: OpenRequest) -> Option<StreamHandle> {
        let OpenRequest {
            target,
            key,
            callbacks,
            policy,
            attempt_count,
            replaces,
        } = request;

        let generation = self.shared.next_id();
        let gate = Arc::new(DispatchGate::new(Arc::clone(&callbacks)));

        let sink = EventSink::new(
            Arc::downgrade(&self.shared),
            key.clone(),
            generation,
            Arc::clone(&gate),
        );
        let transport: Arc<dyn TransportHandle> = match self.shared.transport.open(&target, sink)
        {
            Ok(handle) => Arc::from(handle),
            Err(error) => {
                tracing::error!(key = %key, target = %target, %error, "failed to create stream connection");
                gate.detach();
                if let Some(previous) = replaces {
                    let mut entries = self.shared.entries.lock();
                    if entries
                        .get(key.as_str())
                        .is_some_and(|entry| entry.generation == previous)
                    {
                        entries.remove(key.as_str());
                    }
                }
                return None;
            }
        };

        let handle = StreamHandle {
            key: key.clone(),
            generation,
            transport: Arc::clone(&transport),
        };
        let record = ManagedConnection {
            target,
            callbacks,
            policy,
            generation,
            gate: Arc::clone(&gate),
            transport: Some(transport),
            attempt_count,
            pending_retry: None,
        };

        let outcome = {
            let mut entries = self.shared.entries.lock();
            let current_generation = entries.get(key.as_str()).map(|entry| entry.generation);
            match replaces {
                Some(previous) if current_generation != Some(previous) => Err(record),
                _ => Ok(entries.insert(key.clone(), record)),
            }
        };

        match outcome {
            Ok(displaced) => {
                if let Some(displaced) = displaced {
                    teardown(key.as_str(), displaced);
                }
                replay_deferred(&self.shared, &gate, &key, generation);
                Some(handle)
            }
            Err(orphan) => {
                tracing::debug!(key = %key, "stream was closed while reconnecting");
                teardown(key.as_str(), orphan);
                None
            }
        }
    }

    fn fire_retry(&self, key: &ConnectionKey, retry_id: u64) {
        let request = {
            let mut entries = self.shared.entries.lock();
            let Some(entry) = entries.get_mut(key.as_str()) else {
                return;
            };
            if entry.pending_retry.as_ref().map(|retry| retry.id) != Some(retry_id) {
                return;
            }
            entry.pending_retry = None;

            OpenRequest {
                target: entry.target.clone(),
                key: key.clone(),
                callbacks: Arc::clone(&entry.callbacks),
                policy: entry.policy,
                attempt_count: entry.attempt_count,
                replaces: Some(entry.generation),
            }
        };

        tracing::info!(
            key = %key,
            attempt = request.attempt_count,
            max_attempts = request.policy.max_attempts,
            "reconnecting stream"
        );
        self.establish(request);
    }
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("keys", &self.list_keys())
            .finish()
    }
}

/// Never fails: close errors are logged.
fn teardown(key: &str, record: ManagedConnection) {
    if let Some(retry) = record.pending_retry {
        retry.task.abort();
        tracing::debug!(key, attempt = retry.schedule.attempt, "cancelled pending reconnect");
    }

    record.gate.detach();

    let Some(transport) = record.transport else {
        return;
    };
    if !transport.ready_state().is_active() {
        return;
    }

    match transport.close() {
        Ok(()) => tracing::info!(key, "closed stream connection"),
        Err(error) => tracing::warn!(key, %error, "error while closing stream connection"),
    }
}

pub(crate) fn dispatch_event(
    shared: &Arc<RegistryShared>,
    gate: &DispatchGate,
    key: &ConnectionKey,
    generation: u64,
    event: TransportEvent,
) {
    let guard = gate.hold();
    let callbacks = {
        let mut slot = guard.borrow_mut();
        if let Some(deferred) = slot.deferred.as_mut() {
            deferred.push(event);
            return;
        }
        slot.callbacks.clone()
    };
    let Some(callbacks) = callbacks else {
        tracing::trace!(key = %key, "dropping event for detached stream");
        return;
    };

    match event {
        TransportEvent::Open => {
            if let Some(entry) = shared
                .entries
                .lock()
                .get_mut(key.as_str())
                .filter(|entry| entry.generation == generation)
            {
                entry.attempt_count = 0;
            }
            tracing::info!(key = %key, "stream connected");
            callbacks.emit_open();
        }
        TransportEvent::Message(mut payload) => match simd_json::to_owned_value(&mut payload) {
            Ok(value) => callbacks.emit_message(value),
            Err(error) => {
                tracing::error!(key = %key, %error, bytes = payload.len(), "failed to decode stream message");
            }
        },
        TransportEvent::Error(error) => {
            tracing::warn!(key = %key, %error, "stream transport error");
            callbacks.emit_error(&error);
        }
        TransportEvent::Closed(info) => {
            tracing::info!(key = %key, code = info.code, clean = info.was_clean, "stream closed");
            record_closure(shared, key, generation, info);
            callbacks.emit_close(info);
            guard.borrow_mut().callbacks = None;
        }
    }
}

fn replay_deferred(
    shared: &Arc<RegistryShared>,
    gate: &DispatchGate,
    key: &ConnectionKey,
    generation: u64,
) {
    let guard = gate.hold();
    let deferred = guard.borrow_mut().deferred.take().unwrap_or_default();
    for event in deferred {
        dispatch_event(shared, gate, key, generation, event);
    }
}

fn record_closure(
    shared: &Arc<RegistryShared>,
    key: &ConnectionKey,
    generation: u64,
    info: CloseInfo,
) {
    let mut entries = shared.entries.lock();
    let Some(entry) = entries.get_mut(key.as_str()) else {
        return;
    };
    if entry.generation != generation {
        return;
    }
    entry.transport = None;

    match entry.policy.evaluate(entry.attempt_count, info) {
        RetryDecision::NotNeeded => {
            entries.remove(key.as_str());
        }
        RetryDecision::Exhausted { attempts } => {
            tracing::warn!(key = %key, attempts, code = info.code, "reconnect attempts exhausted");
            entries.remove(key.as_str());
        }
        RetryDecision::Retry(schedule) => match schedule_retry(shared, key, schedule) {
            Some(pending) => {
                tracing::info!(
                    key = %key,
                    attempt = schedule.attempt,
                    max_attempts = entry.policy.max_attempts,
                    delay_ms = schedule.delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                entry.attempt_count = schedule.attempt;
                entry.pending_retry = Some(pending);
            }
            None => {
                entries.remove(key.as_str());
            }
        },
    }
}

fn schedule_retry(
    shared: &Arc<RegistryShared>,
    key: &ConnectionKey,
    schedule: ScheduledRetry,
) -> Option<PendingRetry> {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            tracing::error!(key = %key, "no async runtime to schedule reconnect");
            return None;
        }
    };

    let id = shared.next_id();
    let registry = Arc::downgrade(shared);
    let retry_key = key.clone();
    let deadline = tokio::time::Instant::now() + schedule.delay;
    let task = runtime.spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if let Some(shared) = registry.upgrade() {
            StreamRegistry { shared }.fire_retry(&retry_key, id);
        }
    });

    Some(PendingRetry {
        id,
        schedule,
        task: task.abort_handle(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{Recorder, ScriptedTransport, Seen};
    use crate::stream::types::{CLOSE_ABNORMAL, CLOSE_NORMAL};
    use std::time::Duration;
    use tokio::time::sleep;

    const KLINE_TARGET: &str = "wss://stream.test/ws/btcusdt@kline_1m";
    const TICKER_TARGET: &str = "wss://stream.test/ws/btcusdt@ticker";

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn setup() -> (ScriptedTransport, StreamRegistry) {
        let transport = ScriptedTransport::new();
        let registry = StreamRegistry::new(transport.clone());
        (transport, registry)
    }

    fn kline_key() -> ConnectionKey {
        ConnectionKey::kline("BTCUSDT", "1m")
    }

    #[test]
    fn connect_registers_entry_before_returning() {
        let (transport, registry) = setup();
        let recorder = Recorder::default();

        let handle = registry
            .connect(
                KLINE_TARGET,
                kline_key(),
                recorder.callbacks(),
                RetryPolicy::default(),
            )
            .expect("scripted transport should open");

        assert_eq!(handle.key(), &kline_key());
        assert!(registry.has("kline_btcusdt_1m"));
        assert_eq!(registry.list_keys(), vec![kline_key()]);
        assert_eq!(registry.state("kline_btcusdt_1m"), Some(ReadyState::Connecting));
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.last().target(), KLINE_TARGET);
    }

    #[tokio::test]
    async fn get_returns_handle_only_while_transport_is_live() {
        let (transport, registry) = setup();
        assert!(registry.get("kline_btcusdt_1m").is_none());

        registry.connect(
            KLINE_TARGET,
            kline_key(),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );
        transport.last().open();

        let handle = registry
            .get("kline_btcusdt_1m")
            .expect("live connection should be returned");
        assert_eq!(handle.key(), &kline_key());
        assert_eq!(handle.ready_state(), ReadyState::Open);

        transport.last().drop_connection();
        assert!(registry.get("kline_btcusdt_1m").is_none());
        assert!(registry.pending_retry("kline_btcusdt_1m").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn closure_raised_inside_open_still_schedules_retry() {
        let (transport, registry) = setup();
        let recorder = Recorder::default();
        let key = kline_key();
        transport.during_next_open(|connection| connection.drop_connection());

        let handle = registry.connect(
            KLINE_TARGET,
            key.clone(),
            recorder.callbacks(),
            RetryPolicy::default(),
        );

        assert!(handle.is_some());
        assert_eq!(recorder.seen(), vec![Seen::Close(CloseInfo::abnormal())]);
        assert!(!registry.has(key.as_str()));
        assert!(registry.list_keys().is_empty());
        assert_eq!(
            registry.pending_retry(key.as_str()),
            Some(ScheduledRetry {
                attempt: 1,
                delay: ms(2_000),
            })
        );

        sleep(ms(2_100)).await;
        assert_eq!(transport.open_count(), 2);
        assert!(registry.has(key.as_str()));
        assert_eq!(registry.state(key.as_str()), Some(ReadyState::Connecting));
    }

    #[tokio::test]
    async fn events_raised_inside_open_are_delivered_in_order() {
        let (transport, registry) = setup();
        let recorder = Recorder::default();
        transport.during_next_open(|connection| {
            connection.open();
            connection.message(r#"{"c":"1.5"}"#);
        });

        registry.connect(
            TICKER_TARGET,
            ConnectionKey::ticker("BTCUSDT"),
            recorder.callbacks(),
            RetryPolicy::default(),
        );

        assert_eq!(
            recorder.seen(),
            vec![Seen::Open, Seen::Message(simd_json::json!({ "c": "1.5" }))]
        );
        assert_eq!(registry.state("ticker_btcusdt"), Some(ReadyState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_construction_forgets_key() {
        let (transport, registry) = setup();
        let recorder = Recorder::default();
        let key = kline_key();
        registry.connect(KLINE_TARGET, key.clone(), recorder.callbacks(), RetryPolicy::default());
        transport.last().open();

        transport.fail_open_for(KLINE_TARGET);
        transport.last().drop_connection();
        assert!(registry.pending_retry(key.as_str()).is_some());

        sleep(ms(2_100)).await;

        assert!(registry.is_empty());
        assert_eq!(transport.open_count(), 1);
        assert_eq!(recorder.seen(), vec![Seen::Open, Seen::Close(CloseInfo::abnormal())]);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_reconnect_tears_down_new_transport() {
        let (transport, registry) = setup();
        let recorder = Recorder::default();
        let key = kline_key();
        registry.connect(KLINE_TARGET, key.clone(), recorder.callbacks(), RetryPolicy::default());
        transport.last().drop_connection();

        let closer = registry.clone();
        transport.during_next_open(move |_| closer.close("kline_btcusdt_1m"));
        sleep(ms(2_100)).await;

        assert_eq!(transport.open_count(), 2);
        assert!(registry.is_empty());
        assert_eq!(transport.last().close_requests(), 1);

        transport.last().message(r#"{"c":"1.0"}"#);
        assert_eq!(recorder.seen(), vec![Seen::Close(CloseInfo::abnormal())]);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 2);
    }

    #[test]
    fn construction_failure_returns_none_without_registering() {
        let (transport, registry) = setup();
        transport.fail_open_for(KLINE_TARGET);

        let handle = registry.connect(
            KLINE_TARGET,
            kline_key(),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );

        assert!(handle.is_none());
        assert!(!registry.has("kline_btcusdt_1m"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reconnecting_same_key_detaches_previous_handlers() {
        let (transport, registry) = setup();
        let first = Recorder::default();
        let second = Recorder::default();

        registry.connect(KLINE_TARGET, kline_key(), first.callbacks(), RetryPolicy::default());
        let stale = transport.last();
        stale.open();

        registry.connect(KLINE_TARGET, kline_key(), second.callbacks(), RetryPolicy::default());

        assert_eq!(registry.list_keys(), vec![kline_key()]);
        assert_eq!(stale.close_requests(), 1);

        stale.message(r#"{"c":"42000.5"}"#);
        stale.drop_connection();

        assert_eq!(first.seen(), vec![Seen::Open]);
        assert!(second.seen().is_empty());
        assert_eq!(registry.pending_retry("kline_btcusdt_1m"), None);
        assert!(registry.has("kline_btcusdt_1m"));
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_and_stream_stays_open() {
        let (transport, registry) = setup();
        let recorder = Recorder::default();
        registry.connect(
            TICKER_TARGET,
            ConnectionKey::ticker("BTCUSDT"),
            recorder.callbacks(),
            RetryPolicy::default(),
        );
        let connection = transport.last();
        connection.open();

        connection.message("not json at all");
        assert_eq!(recorder.seen(), vec![Seen::Open]);
        assert!(registry.has("ticker_btcusdt"));
        assert_eq!(connection.close_requests(), 0);

        connection.message(r#"{"c":"42000.5"}"#);
        assert_eq!(
            recorder.seen(),
            vec![
                Seen::Open,
                Seen::Message(simd_json::json!({ "c": "42000.5" }))
            ]
        );
    }

    #[tokio::test]
    async fn transport_error_is_forwarded_without_removing_entry() {
        let (transport, registry) = setup();
        let recorder = Recorder::default();
        registry.connect(
            TICKER_TARGET,
            ConnectionKey::ticker("BTCUSDT"),
            recorder.callbacks(),
            RetryPolicy::default(),
        );
        let connection = transport.last();
        connection.open();
        connection.error("socket hiccup");

        assert_eq!(recorder.seen(), vec![Seen::Open, Seen::Error]);
        assert!(registry.has("ticker_btcusdt"));
    }

    #[tokio::test(start_paused = true)]
    async fn unclean_closures_back_off_exponentially_until_exhausted() {
        let (transport, registry) = setup();
        let recorder = Recorder::default();
        let key = kline_key();
        registry.connect(KLINE_TARGET, key.clone(), recorder.callbacks(), RetryPolicy::default());

        for (attempt, delay_ms) in [(1, 2_000), (2, 4_000), (3, 8_000)] {
            let opens_before = transport.open_count();
            transport.last().drop_connection();

            assert_eq!(
                registry.pending_retry(key.as_str()),
                Some(ScheduledRetry {
                    attempt,
                    delay: ms(delay_ms),
                })
            );
            assert!(!registry.has(key.as_str()));

            sleep(ms(delay_ms - 1)).await;
            assert_eq!(transport.open_count(), opens_before);

            sleep(ms(2)).await;
            assert_eq!(transport.open_count(), opens_before + 1);
            assert!(registry.has(key.as_str()));
            assert_eq!(registry.attempt_count(key.as_str()), Some(attempt));
            assert_eq!(transport.last().target(), KLINE_TARGET);
        }

        transport.last().drop_connection();
        assert_eq!(registry.pending_retry(key.as_str()), None);
        assert!(registry.is_empty());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 4);

        let unclean = Seen::Close(CloseInfo {
            was_clean: false,
            code: CLOSE_ABNORMAL,
        });
        assert_eq!(recorder.seen(), vec![unclean; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_attempt_count() {
        let (transport, registry) = setup();
        let key = kline_key();
        registry.connect(
            KLINE_TARGET,
            key.clone(),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );

        transport.last().drop_connection();
        sleep(ms(2_100)).await;
        assert_eq!(registry.attempt_count(key.as_str()), Some(1));

        transport.last().open();
        assert_eq!(registry.attempt_count(key.as_str()), Some(0));

        transport.last().drop_connection();
        assert_eq!(
            registry.pending_retry(key.as_str()),
            Some(ScheduledRetry {
                attempt: 1,
                delay: ms(2_000),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clean_closure_never_schedules_retry() {
        let (transport, registry) = setup();
        let recorder = Recorder::default();
        let key = kline_key();
        registry.connect(KLINE_TARGET, key.clone(), recorder.callbacks(), RetryPolicy::default());

        transport.last().drop_connection();
        sleep(ms(2_100)).await;
        assert_eq!(registry.attempt_count(key.as_str()), Some(1));

        transport.last().close_cleanly();

        assert_eq!(registry.pending_retry(key.as_str()), None);
        assert!(registry.is_empty());
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(
            recorder.seen().last(),
            Some(&Seen::Close(CloseInfo::clean(CLOSE_NORMAL)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_pending_retry() {
        let (transport, registry) = setup();
        registry.connect(
            KLINE_TARGET,
            kline_key(),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );
        transport.last().open();
        assert_eq!(
            registry.status("kline_btcusdt_1m"),
            Some(StreamStatus {
                key: kline_key(),
                state: Some(ReadyState::Open),
                attempt_count: 0,
                retry_attempt: None,
                retry_delay_ms: None,
            })
        );

        transport.last().drop_connection();

        assert_eq!(
            registry.status("kline_btcusdt_1m"),
            Some(StreamStatus {
                key: kline_key(),
                state: None,
                attempt_count: 1,
                retry_attempt: Some(1),
                retry_delay_ms: Some(2_000),
            })
        );
        assert_eq!(registry.status("ticker_btcusdt"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_retry() {
        let (transport, registry) = setup();
        let key = kline_key();
        registry.connect(
            KLINE_TARGET,
            key.clone(),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );
        transport.last().open();
        transport.last().drop_connection();
        assert!(registry.pending_retry(key.as_str()).is_some());

        registry.close(key.as_str());

        assert_eq!(registry.pending_retry(key.as_str()), None);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_connect_replaces_pending_retry() {
        let (transport, registry) = setup();
        let key = kline_key();
        registry.connect(
            KLINE_TARGET,
            key.clone(),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );
        transport.last().drop_connection();

        registry.connect(
            KLINE_TARGET,
            key.clone(),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );
        assert_eq!(registry.pending_retry(key.as_str()), None);
        assert_eq!(registry.attempt_count(key.as_str()), Some(0));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 2);
    }

    #[test]
    fn close_is_idempotent() {
        let (transport, registry) = setup();
        registry.close("kline_btcusdt_1m");

        registry.connect(
            KLINE_TARGET,
            kline_key(),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );
        transport.last().open();
        registry.close("kline_btcusdt_1m");
        registry.close("kline_btcusdt_1m");

        assert!(!registry.has("kline_btcusdt_1m"));
        assert_eq!(transport.last().close_requests(), 1);
    }

    #[test]
    fn stale_handle_does_not_close_newer_connection() {
        let (transport, registry) = setup();
        let stale = registry
            .connect(
                KLINE_TARGET,
                kline_key(),
                Recorder::default().callbacks(),
                RetryPolicy::default(),
            )
            .expect("scripted transport should open");
        let current = registry
            .connect(
                KLINE_TARGET,
                kline_key(),
                Recorder::default().callbacks(),
                RetryPolicy::default(),
            )
            .expect("scripted transport should open");

        assert!(!registry.close_handle(&stale));
        assert!(registry.has("kline_btcusdt_1m"));
        assert!(registry.close_handle(&current));
        assert!(!registry.has("kline_btcusdt_1m"));
        assert_eq!(transport.open_count(), 2);
    }

    #[test]
    fn close_by_prefix_keeps_excluded_key_and_other_channels() {
        let (_transport, registry) = setup();
        for key in ["kline_btcusdt_1m", "kline_ethusdt_1h", "ticker_btcusdt"] {
            registry.connect(
                "wss://stream.test/ws/any",
                ConnectionKey::from(key),
                Recorder::default().callbacks(),
                RetryPolicy::default(),
            );
        }

        let closed = registry.close_by_prefix("kline_", Some("kline_ethusdt_1h"));

        let mut keys = registry.list_keys();
        keys.sort();
        assert_eq!(closed, 1);
        assert_eq!(
            keys,
            vec![
                ConnectionKey::from("kline_ethusdt_1h"),
                ConnectionKey::from("ticker_btcusdt")
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_empties_registry_even_when_a_close_fails() {
        let (transport, registry) = setup();
        transport.fail_close_for(TICKER_TARGET);

        registry.connect(
            KLINE_TARGET,
            kline_key(),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );
        let kline = transport.last();
        kline.open();
        registry.connect(
            TICKER_TARGET,
            ConnectionKey::ticker("BTCUSDT"),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );
        let ticker = transport.last();
        ticker.open();
        registry.connect(
            "wss://stream.test/ws/ethusdt@ticker",
            ConnectionKey::ticker("ETHUSDT"),
            Recorder::default().callbacks(),
            RetryPolicy::default(),
        );
        transport.last().drop_connection();
        assert!(registry.pending_retry("ticker_ethusdt").is_some());

        registry.close_all();

        assert!(registry.list_keys().is_empty());
        assert!(registry.is_empty());
        assert_eq!(kline.close_requests(), 1);
        assert_eq!(ticker.close_requests(), 1);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 3);
    }

    #[tokio::test]
    async fn callbacks_may_close_their_own_stream() {
        let (transport, registry) = setup();
        let closer = registry.clone();
        let callbacks = Arc::new(
            StreamCallbacks::new().on_message(move |_| closer.close("ticker_btcusdt")),
        );
        registry.connect(
            TICKER_TARGET,
            ConnectionKey::ticker("BTCUSDT"),
            callbacks,
            RetryPolicy::default(),
        );
        let connection = transport.last();
        connection.open();

        connection.message(r#"{"c":"1.0"}"#);

        assert!(!registry.has("ticker_btcusdt"));
        assert_eq!(connection.close_requests(), 1);
    }
}
