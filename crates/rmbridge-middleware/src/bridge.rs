//! [`Bridge`] – the request/response facade over the native bridge.
//!
//! The native library speaks in fire-and-forget events whose results come
//! back later, on a thread it owns, through one callback slot per event
//! type. `Bridge` turns that into something feature modules can share:
//!
//! | Concern | Mechanism |
//! |---|---|
//! | Key subscriptions | [`ListenerTable`] keyed by [`Key`]; `StartListening` on first subscriber, `StopListening` on last |
//! | Raw event streams | [`ListenerTable`] keyed by [`EventType`]; native callback installed on first subscriber |
//! | Replies | correlated to their request by the tag's sequence number |
//! | Stale requests | completed with [`BridgeError::Timeout`] on the next sweep |
//!
//! Replies to key requests arrive on the request's own event type with the
//! request tag echoed. Subscription updates arrive on `StartListening` with
//! the key's sub-type as the event sub-type.
//!
//! Blocking, callback and `async` request variants live in [`crate::rpc`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use rmbridge_native::{CreateOptions, EventCallback, NativeBridge, Wrapper};
use rmbridge_types::tag::{self, DataType};
use rmbridge_types::{
    BridgeError, Event, EventType, Key, KeyResult, SequenceGenerator, Token, TokenGenerator, Value,
};
use tracing::{debug, info, warn};

use crate::listeners::ListenerTable;

/// Callback receiving every result for a subscribed key.
pub type KeyListener = dyn Fn(&KeyResult) + Send + Sync;

/// Callback receiving raw payloads for a subscribed event type, along with
/// the payload discriminator carried in the tag.
pub type EventListener = dyn Fn(&[u8], Option<DataType>) + Send + Sync;

/// Receives the reply to one request, or the local error that ended it.
pub(crate) type Completion = Box<dyn FnOnce(Result<KeyResult, BridgeError>) + Send>;

/// Default bound on how long a request may stay unanswered.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Event types whose callbacks carry key results.
const KEY_REPLY_TYPES: [EventType; 5] = [
    EventType::SetValue,
    EventType::GetValue,
    EventType::GetAvailableValue,
    EventType::PerformAction,
    EventType::StartListening,
];

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub create: CreateOptions,
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            create: CreateOptions::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

pub(crate) struct Pending {
    pub(crate) key: Key,
    pub(crate) event_type: EventType,
    pub(crate) tag: u64,
    pub(crate) deadline: Instant,
    pub(crate) complete: Completion,
}

pub(crate) struct Inner {
    pub(crate) wrapper: Wrapper,
    pub(crate) config: BridgeConfig,
    sequences: SequenceGenerator,
    key_listeners: ListenerTable<Key, KeyListener>,
    event_listeners: ListenerTable<EventType, EventListener>,
    cache: RwLock<HashMap<Key, KeyResult>>,
    pub(crate) pending: Mutex<HashMap<u64, Pending>>,
}

/// Cheaply cloneable handle; all clones share one native bridge.
#[derive(Clone)]
pub struct Bridge {
    pub(crate) inner: Arc<Inner>,
}

impl Bridge {
    pub fn new(native: Arc<dyn NativeBridge>, config: BridgeConfig) -> Self {
        let tokens = Arc::new(TokenGenerator::new());
        Self {
            inner: Arc::new(Inner {
                wrapper: Wrapper::new(native),
                config,
                sequences: SequenceGenerator::new(),
                key_listeners: ListenerTable::new(Arc::clone(&tokens)),
                event_listeners: ListenerTable::new(tokens),
                cache: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Bring up the native library and route key replies into the bridge.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AlreadyStarted`], or the native error if the library
    /// fails to come up.
    pub fn start(&self) -> Result<(), BridgeError> {
        self.inner.wrapper.start(&self.inner.config.create)?;

        for event_type in KEY_REPLY_TYPES {
            let weak = Arc::downgrade(&self.inner);
            let handler: EventCallback = Arc::new(move |code, data: &[u8], tag| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_key_callback(code, data, tag);
                }
            });
            self.inner.wrapper.set_event_callback(event_type, Some(handler));
        }

        info!(name = %self.inner.config.create.name, "bridge started");
        Ok(())
    }

    /// Shut down the native library.
    ///
    /// Outstanding requests complete with [`BridgeError::NotConnected`],
    /// every listener is dropped and the key-value cache is emptied.
    pub fn stop(&self) -> Result<(), BridgeError> {
        if !self.is_started() {
            return Err(BridgeError::NotStarted);
        }

        for event_type in KEY_REPLY_TYPES {
            self.inner.wrapper.set_event_callback(event_type, None);
        }
        for event_type in self.inner.event_listeners.clear() {
            self.inner.wrapper.set_event_callback(event_type, None);
        }
        let dropped = self.inner.key_listeners.clear();
        if !dropped.is_empty() {
            debug!(keys = dropped.len(), "dropping key listeners on stop");
        }
        self.inner.clear_cache();

        let pending: Vec<Pending> = self.inner.lock_pending().drain().map(|(_, p)| p).collect();
        for p in pending {
            (p.complete)(Err(BridgeError::NotConnected));
        }

        self.inner.wrapper.stop()?;
        info!("bridge stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.wrapper.is_running()
    }

    // ─── Key listeners ─────────────────────────────────────────────────────

    /// Subscribe `listener` to every result for `key`.
    ///
    /// The first subscriber for a key sends `StartListening`. With
    /// `immediate` set, the current value is fetched and handed to
    /// `listener` before this returns; a value change racing the fetch may
    /// then be seen twice.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] before [`Bridge::start`],
    /// [`BridgeError::AccessDenied`] if the key cannot be subscribed to.
    pub fn add_key_listener<F>(&self, key: Key, listener: F, immediate: bool) -> Result<Token, BridgeError>
    where
        F: Fn(&KeyResult) + Send + Sync + 'static,
    {
        self.inner.ensure_started()?;
        check_access(key, key.is_subscribable(), "subscribe")?;

        let listener: Arc<KeyListener> = Arc::new(listener);
        let token = self.inner.key_listeners.add(key, Arc::clone(&listener), || {
            let event = Event::for_key(EventType::StartListening, &key);
            self.inner.wrapper.send_event(event.code(), &[], 0)
        })?;
        debug!(%key, %token, "key listener added");

        if immediate && key.is_readable() {
            let result = self
                .get_key_result_sync(key, true)
                .unwrap_or_else(|e| KeyResult::from_error(Some(key), 0, &e));
            listener(&result);
        }
        Ok(token)
    }

    /// The last removal for a key also forgets its cached value.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotFound`] if `token` is not subscribed to `key`.
    pub fn remove_key_listener(&self, key: Key, token: Token) -> Result<(), BridgeError> {
        self.inner.key_listeners.remove(key, token, || {
            self.inner.evict(key);
            let event = Event::for_key(EventType::StopListening, &key);
            if let Err(e) = self.inner.wrapper.send_event(event.code(), &[], 0) {
                warn!(%key, error = %e, "could not send StopListening");
            }
        })?;
        debug!(%key, %token, "key listener removed");
        Ok(())
    }

    pub fn key_listener_count(&self, key: Key) -> usize {
        self.inner.key_listeners.count(key)
    }

    /// Latest successful subscription result seen for `key`.
    pub fn cached(&self, key: Key) -> Option<KeyResult> {
        self.inner
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    // ─── Event-type listeners ──────────────────────────────────────────────

    /// Subscribe `listener` to raw payloads of `event_type`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ReservedEventType`] for event types that carry key
    /// results; those are owned by the bridge.
    pub fn add_event_type_listener<F>(&self, event_type: EventType, listener: F) -> Result<Token, BridgeError>
    where
        F: Fn(&[u8], Option<DataType>) + Send + Sync + 'static,
    {
        if event_type.is_key_operation() {
            return Err(BridgeError::ReservedEventType(event_type.code()));
        }

        let token = self.inner.event_listeners.add(event_type, Arc::new(listener), || {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let handler: EventCallback = Arc::new(move |_, data: &[u8], tag| {
                if let Some(inner) = weak.upgrade() {
                    let data_type = DataType::from_raw(tag::decode(tag).0);
                    inner.event_listeners.deliver(event_type, |l| l(data, data_type));
                }
            });
            self.inner.wrapper.set_event_callback(event_type, Some(handler));
            Ok(())
        })?;
        debug!(%event_type, %token, "event type listener added");
        Ok(token)
    }

    pub fn remove_event_type_listener(&self, event_type: EventType, token: Token) -> Result<(), BridgeError> {
        self.inner.event_listeners.remove(event_type, token, || {
            self.inner.wrapper.set_event_callback(event_type, None);
        })
    }

    pub fn event_listener_count(&self, event_type: EventType) -> usize {
        self.inner.event_listeners.count(event_type)
    }

    // ─── Raw events ────────────────────────────────────────────────────────

    pub fn send_event(&self, event: &Event) -> Result<(), BridgeError> {
        self.send_event_with_bytes(event, &[])
    }

    pub fn send_event_with_bytes(&self, event: &Event, data: &[u8]) -> Result<(), BridgeError> {
        self.inner.ensure_started()?;
        let tag = self.inner.next_tag(DataType::String)?;
        self.inner.wrapper.send_event(event.code(), data, tag)
    }

    pub fn send_event_with_string(&self, event: &Event, data: &str) -> Result<(), BridgeError> {
        self.inner.ensure_started()?;
        let tag = self.inner.next_tag(DataType::String)?;
        self.inner.wrapper.send_event_with_string(event.code(), data, tag)
    }

    pub fn send_event_with_number(&self, event: &Event, data: u64) -> Result<(), BridgeError> {
        self.inner.ensure_started()?;
        let tag = self.inner.next_tag(DataType::Number)?;
        self.inner.wrapper.send_event_with_number(event.code(), data, tag)
    }

    pub fn security_key(&self, index: u32) -> Result<Option<String>, BridgeError> {
        self.inner.ensure_started()?;
        self.inner.wrapper.security_key(index)
    }

    // ─── Request bookkeeping ───────────────────────────────────────────────

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Complete every request past its deadline with
    /// [`BridgeError::Timeout`]. Returns how many were expired.
    pub fn expire_pending(&self) -> usize {
        self.inner.expire_pending(Instant::now())
    }
}

impl Inner {
    pub(crate) fn ensure_started(&self) -> Result<(), BridgeError> {
        if self.wrapper.is_running() {
            Ok(())
        } else {
            Err(BridgeError::NotConnected)
        }
    }

    fn next_tag(&self, data_type: DataType) -> Result<u64, BridgeError> {
        tag::encode(data_type, self.sequences.next())
    }

    pub(crate) fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a key request and register `complete` for its reply. Returns the
    /// request sequence number.
    pub(crate) fn send_key_request(
        &self,
        event_type: EventType,
        key: Key,
        payload: Option<String>,
        complete: Completion,
    ) -> Result<u64, BridgeError> {
        self.ensure_started()?;
        self.expire_pending(Instant::now());

        let sequence = self.sequences.next();
        let tag = tag::encode(DataType::String, sequence)?;
        self.lock_pending().insert(
            sequence,
            Pending {
                key,
                event_type,
                tag,
                deadline: Instant::now() + self.config.request_timeout,
                complete,
            },
        );

        let event = Event::for_key(event_type, &key);
        let sent = match &payload {
            Some(data) => self.wrapper.send_event_with_string(event.code(), data, tag),
            None => self.wrapper.send_event(event.code(), &[], tag),
        };
        if let Err(e) = sent {
            self.lock_pending().remove(&sequence);
            return Err(e);
        }
        debug!(%event_type, %key, tag, "key request sent");
        Ok(sequence)
    }

    /// Forget a request without completing it.
    pub(crate) fn cancel(&self, sequence: u64) -> bool {
        self.lock_pending().remove(&sequence).is_some()
    }

    fn expire_pending(&self, now: Instant) -> usize {
        let expired: Vec<Pending> = {
            let mut pending = self.lock_pending();
            let stale: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(seq, _)| *seq)
                .collect();
            stale.iter().filter_map(|seq| pending.remove(seq)).collect()
        };

        let count = expired.len();
        for p in expired {
            warn!(event_type = %p.event_type, key = %p.key, tag = p.tag, "request expired without reply");
            let error = BridgeError::timeout(format!("{} reply for {}", p.event_type, p.key), self.config.request_timeout);
            (p.complete)(Err(error));
        }
        count
    }

    fn on_key_callback(&self, event_code: u64, data: &[u8], tag: u64) {
        let event_type = (event_code >> 32) as u32;
        let result = KeyResult::from_json(data);

        if event_type == EventType::StartListening.code() {
            self.on_key_update(event_code as u32, result);
        } else {
            self.on_key_reply(tag, result);
        }
        self.expire_pending(Instant::now());
    }

    fn on_key_update(&self, sub_type: u32, result: KeyResult) {
        let key = match result.key().map_or_else(|| Key::from_sub_type(sub_type), Ok) {
            Ok(key) => key,
            Err(e) => {
                warn!(sub_type, error = %e, "update for unknown key dropped");
                return;
            }
        };

        // Only subscribed keys are cached; an update racing the last removal
        // must not bring a forgotten value back.
        if result.succeeded() && self.key_listeners.count(key) > 0 {
            self.cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, result.clone());
        }
        self.key_listeners.deliver(key, |l| l(&result));
    }

    fn on_key_reply(&self, tag: u64, result: KeyResult) {
        let sequence = tag::sequence(tag);
        let Some(pending) = self.lock_pending().remove(&sequence) else {
            warn!(tag, result = %result, "reply matched no outstanding request");
            return;
        };

        let result = match result.key() {
            Some(key) if key != pending.key => {
                warn!(expected = %pending.key, got = %key, tag, "reply key mismatch");
                result
            }
            Some(_) => result,
            None => KeyResult::new(
                Some(pending.key),
                tag,
                result.error_code(),
                result.error_desc(),
                Value::Null,
            ),
        };
        (pending.complete)(Ok(result));
    }

    fn evict(&self, key: Key) {
        if self.cache.write().unwrap_or_else(PoisonError::into_inner).remove(&key).is_some() {
            debug!(%key, "cached value dropped");
        }
    }

    fn clear_cache(&self) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

pub(crate) fn check_access(key: Key, allowed: bool, operation: &'static str) -> Result<(), BridgeError> {
    if allowed {
        Ok(())
    } else {
        Err(BridgeError::AccessDenied {
            key: key.name(),
            operation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmbridge_native::sim::SimulatedBridge;
    use rmbridge_types::keys;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started(timeout: Duration) -> Result<(Arc<SimulatedBridge>, Bridge), BridgeError> {
        let sim = Arc::new(SimulatedBridge::new());
        let bridge = Bridge::new(
            sim.clone(),
            BridgeConfig {
                request_timeout: timeout,
                ..BridgeConfig::default()
            },
        );
        bridge.start()?;
        Ok((sim, bridge))
    }

    #[test]
    fn calls_before_start_are_not_connected() {
        let bridge = Bridge::new(Arc::new(SimulatedBridge::new()), BridgeConfig::default());
        assert!(matches!(
            bridge.add_key_listener(keys::CAMERA_MODE, |_| {}, false),
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            bridge.send_event(&Event::new(EventType::StartVideo)),
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(bridge.stop(), Err(BridgeError::NotStarted)));
    }

    #[test]
    fn shared_subscription_is_reference_counted() -> Result<(), BridgeError> {
        let (sim, bridge) = started(DEFAULT_REQUEST_TIMEOUT)?;
        let hits = Arc::new(AtomicUsize::new(0));

        let tokens: Vec<Token> = (0..3)
            .map(|_| {
                let h = Arc::clone(&hits);
                bridge.add_key_listener(
                    keys::CAMERA_MODE,
                    move |_| {
                        h.fetch_add(1, Ordering::SeqCst);
                    },
                    false,
                )
            })
            .collect::<Result<_, _>>()?;

        sim.set_value(keys::CAMERA_MODE, json!(1));
        sim.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        for token in tokens {
            bridge.remove_key_listener(keys::CAMERA_MODE, token)?;
        }
        assert_eq!(sim.listen_starts(keys::CAMERA_MODE), 1);
        assert_eq!(sim.listen_stops(keys::CAMERA_MODE), 1);
        assert_eq!(bridge.key_listener_count(keys::CAMERA_MODE), 0);
        Ok(())
    }

    #[test]
    fn updates_feed_the_cache() -> Result<(), BridgeError> {
        let (sim, bridge) = started(DEFAULT_REQUEST_TIMEOUT)?;
        bridge.add_key_listener(keys::ROBOMASTER_BATTERY_PERCENT, |_| {}, false)?;

        sim.set_value(keys::ROBOMASTER_BATTERY_PERCENT, json!(64));
        sim.flush();

        let cached = bridge.cached(keys::ROBOMASTER_BATTERY_PERCENT).expect("cached");
        assert_eq!(cached.value().as_u64(), Some(64));
        Ok(())
    }

    #[test]
    fn stop_empties_the_cache() -> Result<(), BridgeError> {
        let (sim, bridge) = started(DEFAULT_REQUEST_TIMEOUT)?;
        bridge.add_key_listener(keys::ROBOMASTER_BATTERY_PERCENT, |_| {}, false)?;
        sim.set_value(keys::ROBOMASTER_BATTERY_PERCENT, json!(40));
        sim.flush();
        assert!(bridge.cached(keys::ROBOMASTER_BATTERY_PERCENT).is_some());

        bridge.stop()?;
        assert!(bridge.cached(keys::ROBOMASTER_BATTERY_PERCENT).is_none());
        Ok(())
    }

    #[test]
    fn immediate_fire_delivers_current_value() -> Result<(), BridgeError> {
        let (_sim, bridge) = started(DEFAULT_REQUEST_TIMEOUT)?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        bridge.add_key_listener(
            keys::AIRLINK_CONNECTION,
            move |r| sink.lock().unwrap().push(r.value().as_bool()),
            true,
        )?;

        assert_eq!(seen.lock().unwrap().as_slice(), &[Some(false)]);
        Ok(())
    }

    #[test]
    fn access_is_checked() -> Result<(), BridgeError> {
        let (_sim, bridge) = started(DEFAULT_REQUEST_TIMEOUT)?;
        let err = bridge.add_key_listener(keys::CAMERA_START_SHOOT_PHOTO, |_| {}, false);
        assert!(matches!(
            err,
            Err(BridgeError::AccessDenied { operation: "subscribe", .. })
        ));
        Ok(())
    }

    #[test]
    fn event_type_listeners_share_one_native_callback() -> Result<(), BridgeError> {
        let (sim, bridge) = started(DEFAULT_REQUEST_TIMEOUT)?;
        let frames = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let f = Arc::clone(&frames);
            bridge.add_event_type_listener(EventType::VideoDataRecv, move |data, _| {
                f.lock().unwrap().push(("a", data.to_vec()));
            })?
        };
        let b = {
            let f = Arc::clone(&frames);
            bridge.add_event_type_listener(EventType::VideoDataRecv, move |data, dt| {
                assert_eq!(dt, Some(DataType::String));
                f.lock().unwrap().push(("b", data.to_vec()));
            })?
        };
        assert!(sim.callback_enabled(EventType::VideoDataRecv));

        bridge.send_event(&Event::new(EventType::StartVideo))?;
        sim.push_video_frame(&[1, 2, 3]);
        sim.flush();
        assert_eq!(frames.lock().unwrap().len(), 2);

        bridge.remove_event_type_listener(EventType::VideoDataRecv, a)?;
        assert!(sim.callback_enabled(EventType::VideoDataRecv));
        bridge.remove_event_type_listener(EventType::VideoDataRecv, b)?;
        assert!(!sim.callback_enabled(EventType::VideoDataRecv));
        Ok(())
    }

    #[test]
    fn key_operation_types_are_reserved() -> Result<(), BridgeError> {
        let (_sim, bridge) = started(DEFAULT_REQUEST_TIMEOUT)?;
        assert!(matches!(
            bridge.add_event_type_listener(EventType::GetValue, |_, _| {}),
            Err(BridgeError::ReservedEventType(1))
        ));
        Ok(())
    }

    #[test]
    fn raw_sends_carry_the_payload_discriminator() -> Result<(), BridgeError> {
        let (sim, bridge) = started(DEFAULT_REQUEST_TIMEOUT)?;
        let mut event = Event::new(EventType::Connection);
        event.reset_sub_type(rmbridge_types::event::connection::SET_PORT);
        bridge.send_event_with_number(&event, 10607)?;
        bridge.send_event_with_string(&event, "x")?;

        let sent = sim.sent_events();
        assert_eq!(tag::decode(sent[0].tag).0, DataType::Number as u8);
        assert_eq!(tag::decode(sent[1].tag).0, DataType::String as u8);
        assert_ne!(tag::sequence(sent[0].tag), tag::sequence(sent[1].tag));
        Ok(())
    }

    #[test]
    fn stop_fails_outstanding_requests() -> Result<(), BridgeError> {
        let (sim, bridge) = started(Duration::from_secs(30))?;
        sim.drop_requests(true);
        let outcome = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&outcome);
        bridge.get_key_value(keys::CAMERA_MODE, move |r| {
            *sink.lock().unwrap() = Some(r.error_desc().to_string());
        })?;
        assert_eq!(bridge.pending_requests(), 1);

        bridge.stop()?;
        assert_eq!(bridge.pending_requests(), 0);
        let desc = outcome.lock().unwrap().clone().expect("completed");
        assert!(desc.contains("not connected"));
        Ok(())
    }

    #[test]
    fn expired_requests_complete_with_timeout() -> Result<(), BridgeError> {
        let (sim, bridge) = started(Duration::from_millis(20))?;
        sim.drop_requests(true);
        let outcome = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&outcome);
        bridge.get_key_value(keys::CAMERA_MODE, move |r| {
            *sink.lock().unwrap() = Some((r.succeeded(), r.error_desc().to_string()));
        })?;

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(bridge.expire_pending(), 1);
        let (ok, desc) = outcome.lock().unwrap().clone().expect("completed");
        assert!(!ok);
        assert!(desc.contains("Timed out"));
        Ok(())
    }
}
