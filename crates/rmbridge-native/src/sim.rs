//! In-process device model for running the stack without hardware.
//!
//! [`SimulatedBridge`] implements [`NativeBridge`] and behaves the way the
//! vendor library does from the caller's point of view:
//!
//! - replies and subscription updates are delivered on a dedicated thread,
//!   never on the thread that sent the request;
//! - callbacks are only delivered for event types that have been enabled
//!   with `set_event_callback`;
//! - key replies echo the request tag on the request's own event type, and
//!   subscription updates arrive on `StartListening` with tag 0.
//!
//! The model keeps a table of key values, answers `GetValue`/`SetValue`/
//! `PerformAction`, tracks `StartListening`/`StopListening` per key and
//! toggles `AirLinkConnection` in response to the connection event
//! sequence. Test hooks let callers drop or fail requests, push updates and
//! inspect everything that was sent.
//!
//! ```rust
//! use std::sync::Arc;
//! use rmbridge_native::{CreateOptions, Wrapper, sim::SimulatedBridge};
//!
//! let sim = Arc::new(SimulatedBridge::new());
//! let wrapper = Wrapper::new(sim.clone());
//! wrapper.start(&CreateOptions::default()).expect("sim starts");
//! wrapper.stop().expect("sim stops");
//! ```

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rmbridge_types::event::connection;
use rmbridge_types::{BridgeError, Event, EventType, Key, keys};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::native::{CreateOptions, NativeBridge};
use crate::registry::CallbackRegistry;

/// Payload of a recorded send.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    String(String),
    Number(u64),
}

/// One call to a `send_event*` primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct SentEvent {
    pub event_code: u64,
    pub payload: Payload,
    pub tag: u64,
}

impl SentEvent {
    pub fn event_type(&self) -> u32 {
        (self.event_code >> 32) as u32
    }

    pub fn sub_type(&self) -> u32 {
        self.event_code as u32
    }
}

enum Delivery {
    Callback {
        event_code: u64,
        payload: Vec<u8>,
        tag: u64,
    },
    Barrier(Sender<()>),
}

#[derive(Default)]
struct SimState {
    values: HashMap<u32, serde_json::Value>,
    listening: HashMap<u32, usize>,
    listen_starts: HashMap<u32, usize>,
    listen_stops: HashMap<u32, usize>,
    enabled: HashSet<u32>,
    sent: Vec<SentEvent>,
    drop_requests: bool,
    fail_next: Option<i32>,
    refuse_connection: bool,
    connected: bool,
    target_ip: Option<String>,
    target_port: Option<u64>,
    video_streaming: bool,
    created: bool,
}

/// Simulated vendor library. See the module docs.
pub struct SimulatedBridge {
    state: Arc<Mutex<SimState>>,
    registry: Arc<RwLock<Weak<CallbackRegistry>>>,
    queue: Mutex<Option<Sender<Delivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SimulatedBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBridge {
    /// A device with a handful of identity keys populated and the link down.
    pub fn new() -> Self {
        let mut state = SimState::default();
        state.values.insert(keys::PRODUCT_NAME.sub_type(), json!("RoboMaster S1"));
        state.values.insert(keys::FIRMWARE_VERSION.sub_type(), json!("00.06.0100"));
        state.values.insert(keys::AIRLINK_CONNECTION.sub_type(), json!(false));
        state.values.insert(keys::CAMERA_MODE.sub_type(), json!(0));
        state.values.insert(keys::ROBOMASTER_BATTERY_PERCENT.sub_type(), json!(100));

        Self {
            state: Arc::new(Mutex::new(state)),
            registry: Arc::new(RwLock::new(Weak::new())),
            queue: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Seed a key value without notifying listeners.
    pub fn with_value(self, key: Key, value: serde_json::Value) -> Self {
        self.lock().values.insert(key.sub_type(), value);
        self
    }

    // ─── Test hooks ────────────────────────────────────────────────────────

    /// Change a key value as if the device did, notifying listeners.
    pub fn set_value(&self, key: Key, value: serde_json::Value) {
        let update = {
            let mut state = self.lock();
            state.values.insert(key.sub_type(), value.clone());
            key_update(&state, key.sub_type(), &value)
        };
        if let Some(d) = update {
            self.enqueue(d);
        }
    }

    pub fn value(&self, key: Key) -> Option<serde_json::Value> {
        self.lock().values.get(&key.sub_type()).cloned()
    }

    /// Silently swallow key requests while `drop` is set.
    pub fn drop_requests(&self, drop: bool) {
        self.lock().drop_requests = drop;
    }

    /// Fail the next key request with `code`.
    pub fn fail_next(&self, code: i32) {
        self.lock().fail_next = Some(code);
    }

    /// Keep the link down even after the open event.
    pub fn refuse_connection(&self, refuse: bool) {
        self.lock().refuse_connection = refuse;
    }

    /// Deliver an arbitrary callback, subject to the enabled event types.
    pub fn emit(&self, event_code: u64, payload: &[u8], tag: u64) {
        self.enqueue(Delivery::Callback {
            event_code,
            payload: payload.to_vec(),
            tag,
        });
    }

    /// Deliver a decoded video frame if streaming was started.
    pub fn push_video_frame(&self, frame: &[u8]) {
        if self.lock().video_streaming {
            self.emit(Event::new(EventType::VideoDataRecv).code(), frame, 0);
        }
    }

    pub fn sent_events(&self) -> Vec<SentEvent> {
        self.lock().sent.clone()
    }

    pub fn listen_starts(&self, key: Key) -> usize {
        self.lock().listen_starts.get(&key.sub_type()).copied().unwrap_or(0)
    }

    pub fn listen_stops(&self, key: Key) -> usize {
        self.lock().listen_stops.get(&key.sub_type()).copied().unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_streaming_video(&self) -> bool {
        self.lock().video_streaming
    }

    /// Address configured through the connection events.
    pub fn connection_target(&self) -> (Option<String>, Option<u64>) {
        let state = self.lock();
        (state.target_ip.clone(), state.target_port)
    }

    pub fn callback_enabled(&self, event_type: EventType) -> bool {
        self.lock().enabled.contains(&event_type.code())
    }

    /// Block until every delivery queued so far has been handled.
    ///
    /// Must not be called from inside a callback.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        self.enqueue(Delivery::Barrier(tx));
        if rx.recv_timeout(Duration::from_secs(5)).is_err() {
            warn!("simulated bridge flush timed out");
        }
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, delivery: Delivery) {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.as_ref() {
            Some(tx) => {
                if tx.send(delivery).is_err() {
                    warn!("simulated delivery thread gone; callback dropped");
                }
            }
            None => {
                if let Delivery::Barrier(ack) = delivery {
                    let _ = ack.send(());
                } else {
                    debug!("simulated bridge not created; callback dropped");
                }
            }
        }
    }

    fn handle(&self, event_code: u64, payload: Payload, tag: u64) {
        let sub_type = event_code as u32;
        let deliveries = {
            let mut state = self.lock();
            state.sent.push(SentEvent {
                event_code,
                payload: payload.clone(),
                tag,
            });

            match EventType::from_code((event_code >> 32) as u32) {
                Ok(t) if t.is_key_operation() => handle_key_request(&mut state, t, sub_type, &payload, tag),
                Ok(EventType::Connection) => handle_connection(&mut state, sub_type, &payload),
                Ok(EventType::StartVideo) => {
                    state.video_streaming = true;
                    Vec::new()
                }
                Ok(EventType::StopVideo) => {
                    state.video_streaming = false;
                    Vec::new()
                }
                Ok(_) => Vec::new(),
                Err(e) => {
                    warn!(event_code, error = %e, "simulated bridge ignoring unknown event");
                    Vec::new()
                }
            }
        };

        for d in deliveries {
            self.enqueue(d);
        }
    }
}

fn handle_key_request(
    state: &mut SimState,
    event_type: EventType,
    sub_type: u32,
    payload: &Payload,
    tag: u64,
) -> Vec<Delivery> {
    match event_type {
        EventType::StartListening => {
            *state.listening.entry(sub_type).or_default() += 1;
            *state.listen_starts.entry(sub_type).or_default() += 1;
            return Vec::new();
        }
        EventType::StopListening => {
            if let Some(n) = state.listening.get_mut(&sub_type) {
                *n = n.saturating_sub(1);
            }
            *state.listen_stops.entry(sub_type).or_default() += 1;
            return Vec::new();
        }
        _ => {}
    }

    if state.drop_requests {
        debug!(%event_type, sub_type, tag, "simulated bridge dropping request");
        return Vec::new();
    }

    let reply_code = (u64::from(event_type.code()) << 32) | u64::from(sub_type);
    if let Some(code) = state.fail_next.take() {
        return vec![envelope(reply_code, sub_type, tag, code, serde_json::Value::Null)];
    }

    match event_type {
        EventType::GetValue | EventType::GetAvailableValue => {
            let value = state
                .values
                .get(&sub_type)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            vec![envelope(reply_code, sub_type, tag, 0, json!({ "value": value }))]
        }
        EventType::SetValue => {
            let value = parse_set_payload(payload);
            state.values.insert(sub_type, value.clone());
            let mut out = vec![envelope(reply_code, sub_type, tag, 0, serde_json::Value::Null)];
            out.extend(key_update(state, sub_type, &value));
            out
        }
        _ => vec![envelope(reply_code, sub_type, tag, 0, serde_json::Value::Null)],
    }
}

fn handle_connection(state: &mut SimState, sub_type: u32, payload: &Payload) -> Vec<Delivery> {
    match (sub_type, payload) {
        (connection::SET_IP, Payload::String(ip)) => {
            state.target_ip = Some(ip.clone());
            Vec::new()
        }
        (connection::SET_PORT, Payload::Number(port)) => {
            state.target_port = Some(*port);
            Vec::new()
        }
        (connection::OPEN, _) if !state.refuse_connection => set_connected(state, true),
        (connection::CLOSE, _) => set_connected(state, false),
        _ => Vec::new(),
    }
}

fn set_connected(state: &mut SimState, connected: bool) -> Vec<Delivery> {
    if state.connected == connected {
        return Vec::new();
    }
    state.connected = connected;
    let sub_type = keys::AIRLINK_CONNECTION.sub_type();
    let value = json!(connected);
    state.values.insert(sub_type, value.clone());
    key_update(state, sub_type, &value).into_iter().collect()
}

fn key_update(state: &SimState, sub_type: u32, value: &serde_json::Value) -> Option<Delivery> {
    let listened = state.listening.get(&sub_type).copied().unwrap_or(0) > 0;
    listened.then(|| {
        let code = (u64::from(EventType::StartListening.code()) << 32) | u64::from(sub_type);
        envelope(code, sub_type, 0, 0, json!({ "value": value }))
    })
}

fn parse_set_payload(payload: &Payload) -> serde_json::Value {
    let parsed = match payload {
        Payload::String(s) => serde_json::from_str(s).unwrap_or(serde_json::Value::Null),
        Payload::Bytes(b) => serde_json::from_slice(b).unwrap_or(serde_json::Value::Null),
        Payload::Number(n) => json!(n),
    };
    match parsed {
        serde_json::Value::Object(mut map) if map.contains_key("value") => {
            map.remove("value").unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

fn envelope(event_code: u64, sub_type: u32, tag: u64, error: i32, value: serde_json::Value) -> Delivery {
    let body = json!({ "Key": sub_type, "Tag": tag, "Error": error, "Value": value });
    Delivery::Callback {
        event_code,
        payload: body.to_string().into_bytes(),
        tag,
    }
}

fn run_deliveries(
    rx: mpsc::Receiver<Delivery>,
    state: Arc<Mutex<SimState>>,
    registry: Arc<RwLock<Weak<CallbackRegistry>>>,
) {
    for delivery in rx {
        match delivery {
            Delivery::Barrier(ack) => {
                let _ = ack.send(());
            }
            Delivery::Callback {
                event_code,
                payload,
                tag,
            } => {
                let event_type = (event_code >> 32) as u32;
                let enabled = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .enabled
                    .contains(&event_type);
                if !enabled {
                    continue;
                }
                let Some(registry) = registry
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .upgrade()
                else {
                    continue;
                };
                if panic::catch_unwind(AssertUnwindSafe(|| registry.dispatch(event_code, &payload, tag))).is_err() {
                    error!(event_code, tag, "event handler panicked");
                }
            }
        }
    }
}

impl NativeBridge for SimulatedBridge {
    fn bind(&self, registry: Arc<CallbackRegistry>) {
        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&registry);
    }

    fn create(&self, options: &CreateOptions) -> Result<(), BridgeError> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let state = Arc::clone(&self.state);
        let registry = Arc::clone(&self.registry);
        let handle = thread::Builder::new()
            .name("rmbridge-sim".into())
            .spawn(move || run_deliveries(rx, state, registry))
            .map_err(|e| BridgeError::Native(format!("could not spawn delivery thread: {e}")))?;

        *queue = Some(tx);
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.lock().created = true;
        debug!(name = %options.name, "simulated bridge created");
        Ok(())
    }

    fn destroy(&self) {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).take();
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = worker {
            if handle.thread().id() == thread::current().id() {
                warn!("simulated bridge destroyed from its own delivery thread");
            } else if handle.join().is_err() {
                error!("simulated delivery thread panicked");
            }
        }
        let mut state = self.lock();
        state.created = false;
        state.enabled.clear();
        debug!("simulated bridge destroyed");
    }

    fn initialize(&self) -> Result<(), BridgeError> {
        if self.lock().created {
            Ok(())
        } else {
            Err(BridgeError::Native("simulated bridge not created".into()))
        }
    }

    fn uninitialize(&self) {}

    fn send_event(&self, event_code: u64, data: &[u8], tag: u64) {
        self.handle(event_code, Payload::Bytes(data.to_vec()), tag);
    }

    fn send_event_with_string(&self, event_code: u64, data: &str, tag: u64) {
        self.handle(event_code, Payload::String(data.to_string()), tag);
    }

    fn send_event_with_number(&self, event_code: u64, data: u64, tag: u64) {
        self.handle(event_code, Payload::Number(data), tag);
    }

    fn set_event_callback(&self, event_type: EventType, enabled: bool) {
        let mut state = self.lock();
        if enabled {
            state.enabled.insert(event_type.code());
        } else {
            state.enabled.remove(&event_type.code());
        }
    }

    fn security_key(&self, index: u32) -> Option<String> {
        Some(format!("sim-security-key-{index}"))
    }
}

impl Drop for SimulatedBridge {
    fn drop(&mut self) {
        if self.queue.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::Wrapper;
    use rmbridge_types::KeyResult;
    use std::thread::ThreadId;

    type Captured = Arc<Mutex<Vec<(u64, KeyResult, ThreadId)>>>;

    fn started() -> Result<(Arc<SimulatedBridge>, Wrapper), BridgeError> {
        let sim = Arc::new(SimulatedBridge::new());
        let wrapper = Wrapper::new(sim.clone());
        wrapper.start(&CreateOptions::default())?;
        Ok((sim, wrapper))
    }

    fn capture(wrapper: &Wrapper, event_type: EventType) -> Captured {
        let seen: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        wrapper.set_event_callback(
            event_type,
            Some(Arc::new(move |code, data: &[u8], _| {
                sink.lock()
                    .unwrap()
                    .push((code, KeyResult::from_json(data), thread::current().id()));
            })),
        );
        seen
    }

    #[test]
    fn get_value_replies_on_delivery_thread_with_tag() -> Result<(), BridgeError> {
        let (sim, wrapper) = started()?;
        let seen = capture(&wrapper, EventType::GetValue);

        let event = Event::for_key(EventType::GetValue, &keys::PRODUCT_NAME);
        wrapper.send_event(event.code(), &[], 77)?;
        sim.flush();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (code, result, thread_id) = &seen[0];
        assert_eq!(*code, event.code());
        assert_eq!(result.tag(), 77);
        assert_eq!(result.value().as_str(), Some("RoboMaster S1"));
        assert_ne!(*thread_id, thread::current().id());
        Ok(())
    }

    #[test]
    fn disabled_event_types_are_not_delivered() -> Result<(), BridgeError> {
        let (sim, wrapper) = started()?;
        let seen = capture(&wrapper, EventType::GetValue);
        wrapper.set_event_callback(EventType::GetValue, None);
        // Re-install in the registry only; native delivery stays off.
        let sink = Arc::clone(&seen);
        wrapper.registry().set(
            EventType::GetValue,
            Some(Arc::new(move |code, data: &[u8], _| {
                sink.lock()
                    .unwrap()
                    .push((code, KeyResult::from_json(data), thread::current().id()));
            })),
        );

        let event = Event::for_key(EventType::GetValue, &keys::PRODUCT_NAME);
        wrapper.send_event(event.code(), &[], 1)?;
        sim.flush();

        assert!(seen.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn set_value_acks_and_notifies_listeners() -> Result<(), BridgeError> {
        let (sim, wrapper) = started()?;
        let acks = capture(&wrapper, EventType::SetValue);
        let updates = capture(&wrapper, EventType::StartListening);

        let listen = Event::for_key(EventType::StartListening, &keys::CAMERA_MODE);
        wrapper.send_event(listen.code(), &[], 0)?;
        let set = Event::for_key(EventType::SetValue, &keys::CAMERA_MODE);
        wrapper.send_event_with_string(set.code(), r#"{"value":2}"#, 5)?;
        sim.flush();

        assert_eq!(sim.value(keys::CAMERA_MODE), Some(json!(2)));
        let acks = acks.lock().unwrap();
        assert_eq!(acks.len(), 1);
        assert!(acks[0].1.succeeded());
        assert_eq!(acks[0].1.tag(), 5);

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.value().as_u64(), Some(2));
        assert_eq!(sim.listen_starts(keys::CAMERA_MODE), 1);
        Ok(())
    }

    #[test]
    fn failure_and_drop_hooks() -> Result<(), BridgeError> {
        let (sim, wrapper) = started()?;
        let seen = capture(&wrapper, EventType::PerformAction);
        let action = Event::for_key(EventType::PerformAction, &keys::CAMERA_START_SHOOT_PHOTO);

        sim.fail_next(9);
        wrapper.send_event(action.code(), &[], 1)?;
        sim.drop_requests(true);
        wrapper.send_event(action.code(), &[], 2)?;
        sim.drop_requests(false);
        wrapper.send_event(action.code(), &[], 3)?;
        sim.flush();

        let seen = seen.lock().unwrap();
        let outcomes: Vec<(u64, i32)> = seen.iter().map(|(_, r, _)| (r.tag(), r.error_code())).collect();
        assert_eq!(outcomes, vec![(1, 9), (3, 0)]);
        assert_eq!(sim.sent_events().len(), 3);
        Ok(())
    }

    #[test]
    fn connection_sequence_toggles_link() -> Result<(), BridgeError> {
        let (sim, wrapper) = started()?;
        let updates = capture(&wrapper, EventType::StartListening);
        let listen = Event::for_key(EventType::StartListening, &keys::AIRLINK_CONNECTION);
        wrapper.send_event(listen.code(), &[], 0)?;

        let mut event = Event::new(EventType::Connection);
        event.reset_sub_type(connection::SET_IP);
        wrapper.send_event_with_string(event.code(), "192.168.2.1", 0)?;
        event.reset_sub_type(connection::SET_PORT);
        wrapper.send_event_with_number(event.code(), 10607, 0)?;
        event.reset_sub_type(connection::OPEN);
        wrapper.send_event(event.code(), &[], 0)?;
        sim.flush();

        assert!(sim.is_connected());
        assert_eq!(
            sim.connection_target(),
            (Some("192.168.2.1".to_string()), Some(10607))
        );

        event.reset_sub_type(connection::CLOSE);
        wrapper.send_event(event.code(), &[], 0)?;
        sim.flush();

        let values: Vec<Option<bool>> = updates
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r, _)| r.value().as_bool())
            .collect();
        assert_eq!(values, vec![Some(true), Some(false)]);
        Ok(())
    }

    #[test]
    fn refused_connection_stays_down() -> Result<(), BridgeError> {
        let (sim, wrapper) = started()?;
        sim.refuse_connection(true);
        let mut event = Event::new(EventType::Connection);
        event.reset_sub_type(connection::OPEN);
        wrapper.send_event(event.code(), &[], 0)?;
        sim.flush();
        assert!(!sim.is_connected());
        Ok(())
    }

    #[test]
    fn video_frames_follow_stream_state() -> Result<(), BridgeError> {
        let (sim, wrapper) = started()?;
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        wrapper.set_event_callback(
            EventType::VideoDataRecv,
            Some(Arc::new(move |_, data: &[u8], _| sink.lock().unwrap().push(data.to_vec()))),
        );

        sim.push_video_frame(b"dropped");
        wrapper.send_event(Event::new(EventType::StartVideo).code(), &[], 0)?;
        sim.push_video_frame(b"frame-1");
        sim.flush();

        assert_eq!(frames.lock().unwrap().as_slice(), &[b"frame-1".to_vec()]);
        Ok(())
    }
}
