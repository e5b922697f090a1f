//! [`Connection`] – brings the link to a device up and down.
//!
//! ```text
//!  Idle ─start()─▶ Discovering ─▶ Handshaking ─▶ Opening ─▶ Connected
//!   ▲                                                          │
//!   └───────────────────────── Closing ◀───────stop()──────────┘
//! ```
//!
//! Any failure on the way up returns the connection to `Idle` with its
//! status listener removed, and reports the [`Stage`] that failed.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rmbridge_finder::{Beacon, Finder, FinderConfig};
use rmbridge_middleware::Bridge;
use rmbridge_types::event::connection;
use rmbridge_types::{BridgeError, Event, EventType, KeyResult, Stage, Token, keys};
use tracing::{debug, info, instrument, warn};

/// Port the device's bridge endpoint listens on.
pub const DEFAULT_BRIDGE_PORT: u64 = 10607;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Discovering,
    Handshaking,
    Opening,
    Connected,
    Closing,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub finder: FinderConfig,
    pub bridge_port: u64,
    pub discovery_timeout: Duration,
    /// Bound on waiting for the link status to flip after open or close.
    pub status_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            finder: FinderConfig::default(),
            bridge_port: DEFAULT_BRIDGE_PORT,
            discovery_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(10),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status cell
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Status {
    connected: bool,
    // Bumped on every real transition.
    generation: u64,
}

/// Link status as last reported by the device, with blocking waits on it.
///
/// Only the status listener writes it. Waiters check a predicate under the
/// lock, so a notify without a transition never releases them.
#[derive(Debug, Default)]
pub struct StatusCell {
    status: Mutex<Status>,
    changed: Condvar,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reported status. Returns whether it was a transition.
    pub fn set(&self, connected: bool) -> bool {
        let transition = {
            let mut status = self.lock();
            let transition = status.connected != connected;
            if transition {
                status.connected = connected;
                status.generation += 1;
            }
            transition
        };
        self.changed.notify_all();
        transition
    }

    pub fn get(&self) -> bool {
        self.lock().connected
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Block until the status equals `target`. Returns `false` on timeout.
    pub fn wait_until(&self, target: bool, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| s.connected != target)
            .unwrap_or_else(PoisonError::into_inner);
        guard.connected == target
    }

    /// Block until a transition past generation `since` leaves the status
    /// at `target`. A status already at `target` when `since` was read does
    /// not count. Returns `false` on timeout.
    pub fn wait_for_transition(&self, target: bool, since: u64, timeout: Duration) -> bool {
        let reached = |s: &Status| s.generation > since && s.connected == target;
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| !reached(s))
            .unwrap_or_else(PoisonError::into_inner);
        reached(&guard)
    }

    /// Block until the status moves away from what it is now. Returns the
    /// new status, or `None` on timeout.
    pub fn wait_for_change(&self, timeout: Duration) -> Option<bool> {
        let guard = self.lock();
        let seen = guard.generation;
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| s.generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        (guard.generation != seen).then_some(guard.connected)
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

pub struct Connection {
    bridge: Bridge,
    finder: Finder,
    config: ConnectionConfig,
    status: Arc<StatusCell>,
    state: Mutex<ConnectionState>,
    listener: Mutex<Option<Token>>,
    beacon: Mutex<Option<Beacon>>,
}

impl Connection {
    pub fn new(bridge: Bridge, config: ConnectionConfig) -> Self {
        Self {
            finder: Finder::new(config.finder.clone()),
            bridge,
            config,
            status: Arc::new(StatusCell::new()),
            state: Mutex::new(ConnectionState::Idle),
            listener: Mutex::new(None),
            beacon: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connected(&self) -> bool {
        self.status.get()
    }

    /// Device found by the last successful [`Connection::start`].
    pub fn beacon(&self) -> Option<Beacon> {
        self.beacon.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Block until the device reports the link up. Returns `false` on
    /// timeout.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.status.wait_until(true, timeout)
    }

    /// Find a device, hand its address to the bridge and wait for the link.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AlreadyStarted`] unless idle; the bridge's error if the
    /// status listener cannot be added; otherwise
    /// [`BridgeError::Connection`] naming the stage that failed.
    #[instrument(name = "connection.start", skip(self))]
    pub async fn start(&self) -> Result<(), BridgeError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ConnectionState::Idle {
                return Err(BridgeError::AlreadyStarted);
            }
            *state = ConnectionState::Discovering;
        }

        if let Err(e) = self.watch_status().await {
            self.set_state(ConnectionState::Idle);
            return Err(e);
        }

        match self.bring_up().await {
            Ok(beacon) => {
                info!(device = %beacon.source_ip(), app_id = beacon.app_id(), "connected");
                *self.beacon.lock().unwrap_or_else(PoisonError::into_inner) = Some(beacon);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "connection attempt failed");
                self.unwatch_status();
                self.set_state(ConnectionState::Idle);
                Err(e)
            }
        }
    }

    /// Close the link and wait for the device to report it down.
    ///
    /// The status listener is removed and the state returns to `Idle` even
    /// when this fails.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotStarted`] unless connected; the bridge's error if
    /// the close event cannot be sent; [`BridgeError::Timeout`] if the
    /// device never reports the link down.
    #[instrument(name = "connection.stop", skip(self))]
    pub async fn stop(&self) -> Result<(), BridgeError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ConnectionState::Connected {
                return Err(BridgeError::NotStarted);
            }
            *state = ConnectionState::Closing;
        }

        let timeout = self.config.status_timeout;
        let result = match self.send_step(connection::CLOSE, Step::Plain) {
            Ok(()) => match self.wait_status(Wait::Until(false), timeout).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(BridgeError::timeout("link down", timeout)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        self.unwatch_status();
        self.beacon.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.set_state(ConnectionState::Idle);
        if result.is_ok() {
            info!("disconnected");
        }
        result
    }

    async fn bring_up(&self) -> Result<Beacon, BridgeError> {
        let beacon = self
            .finder
            .find(self.config.discovery_timeout)
            .await
            .map_err(|e| e.at_stage(Stage::Discovery))?;

        self.set_state(ConnectionState::Handshaking);
        self.finder
            .send_ack(beacon.source_ip(), beacon.app_id())
            .await
            .map_err(|e| e.at_stage(Stage::Handshake))?;

        self.set_state(ConnectionState::Opening);
        // Only a transition reported after this point proves the new link is
        // up; a stale session is closed before the new target is configured.
        let since = self.status.generation();
        let ip = beacon.source_ip().to_string();
        let port = self.config.bridge_port;
        for (sub_type, step) in [
            (connection::CLOSE, Step::Plain),
            (connection::SET_IP, Step::Text(&ip)),
            (connection::SET_PORT, Step::Number(port)),
            (connection::OPEN, Step::Plain),
        ] {
            self.send_step(sub_type, step)
                .map_err(|e| e.at_stage(Stage::Open))?;
        }

        let timeout = self.config.status_timeout;
        let up = self
            .wait_status(Wait::TransitionTo(true, since), timeout)
            .await
            .map_err(|e| e.at_stage(Stage::StatusWait))?;
        if !up {
            return Err(BridgeError::timeout("link up", timeout).at_stage(Stage::StatusWait));
        }
        Ok(beacon)
    }

    fn send_step(&self, sub_type: u32, step: Step<'_>) -> Result<(), BridgeError> {
        let mut event = Event::new(EventType::Connection);
        event.reset_sub_type(sub_type);
        match step {
            Step::Plain => self.bridge.send_event(&event)?,
            Step::Text(text) => self.bridge.send_event_with_string(&event, text)?,
            Step::Number(n) => self.bridge.send_event_with_number(&event, n)?,
        }
        debug!(sub_type, "connection event sent");
        Ok(())
    }

    async fn wait_status(&self, wait: Wait, timeout: Duration) -> Result<bool, BridgeError> {
        let status = Arc::clone(&self.status);
        tokio::task::spawn_blocking(move || match wait {
            Wait::Until(target) => status.wait_until(target, timeout),
            Wait::TransitionTo(target, since) => status.wait_for_transition(target, since, timeout),
        })
        .await
        .map_err(|e| BridgeError::Native(format!("status wait task failed: {e}")))
    }

    /// Subscribe the status cell to the device's link status. The current
    /// value is fetched first so the cell starts from what the device
    /// reports, not from a previous session.
    async fn watch_status(&self) -> Result<(), BridgeError> {
        let bridge = self.bridge.clone();
        let status = Arc::clone(&self.status);
        let token = tokio::task::spawn_blocking(move || {
            bridge.add_key_listener(
                keys::AIRLINK_CONNECTION,
                move |result: &KeyResult| match result.value().as_bool() {
                    Some(connected) if result.succeeded() => {
                        if status.set(connected) {
                            debug!(connected, "link status changed");
                        }
                    }
                    _ => warn!(%result, "unusable link status update"),
                },
                true,
            )
        })
        .await
        .map_err(|e| BridgeError::Native(format!("status listener task failed: {e}")))??;
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Ok(())
    }

    fn unwatch_status(&self) {
        let token = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(token) = token
            && let Err(e) = self.bridge.remove_key_listener(keys::AIRLINK_CONNECTION, token)
        {
            debug!(error = %e, "status listener already gone");
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*state, to = ?next, "connection state");
        *state = next;
    }
}

#[derive(Clone, Copy)]
enum Wait {
    Until(bool),
    TransitionTo(bool, u64),
}

#[derive(Clone, Copy)]
enum Step<'a> {
    Plain,
    Text(&'a str),
    Number(u64),
}
