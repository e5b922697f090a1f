//! [`Camera`] – video stream, capture settings and recording.
//!
//! Video frames arrive as raw `VideoDataRecv` payloads. The stream itself
//! is reference counted: the first frame callback sends `StartVideo`, the
//! last one to go sends `StopVideo`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use rmbridge_middleware::{Bridge, ListenerTable};
use rmbridge_types::{BridgeError, Event, EventType, Key, KeyResult, Token, TokenGenerator, Value, keys};
use tracing::{debug, info, trace, warn};

/// Receives each decoded video frame (1280x720 RGB).
pub type FrameCallback = dyn Fn(&[u8]) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraMode {
    Photo,
    Video,
}

impl CameraMode {
    pub fn raw(self) -> u64 {
        match self {
            CameraMode::Photo => 0,
            CameraMode::Video => 1,
        }
    }

    pub fn from_raw(raw: u64) -> Result<Self, BridgeError> {
        match raw {
            0 => Ok(CameraMode::Photo),
            1 => Ok(CameraMode::Video),
            other => Err(BridgeError::Decode(format!("unknown camera mode {other}"))),
        }
    }
}

pub struct Camera {
    bridge: Bridge,
    frames: Arc<ListenerTable<(), FrameCallback>>,
    streams: Mutex<Vec<(EventType, Token)>>,
    recording: Mutex<Option<Token>>,
    recording_time: Arc<ArcSwap<Duration>>,
    transfer_speed: Arc<ArcSwapOption<f64>>,
}

impl Camera {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            bridge,
            frames: Arc::new(ListenerTable::new(Arc::new(TokenGenerator::new()))),
            streams: Mutex::new(Vec::new()),
            recording: Mutex::new(None),
            recording_time: Arc::new(ArcSwap::from_pointee(Duration::ZERO)),
            transfer_speed: Arc::new(ArcSwapOption::empty()),
        }
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Subscribe to the video data and transfer-speed streams.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AlreadyStarted`] if already started.
    pub fn start(&self) -> Result<(), BridgeError> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if !streams.is_empty() {
            return Err(BridgeError::AlreadyStarted);
        }

        let frames = Arc::clone(&self.frames);
        let data = self.bridge.add_event_type_listener(EventType::VideoDataRecv, move |frame, _| {
            frames.deliver((), |cb| cb(frame));
        })?;
        streams.push((EventType::VideoDataRecv, data));

        let speed = Arc::clone(&self.transfer_speed);
        let rate = self
            .bridge
            .add_event_type_listener(EventType::VideoTransferSpeed, move |payload, _| {
                match parse_speed(payload) {
                    Some(s) => speed.store(Some(Arc::new(s))),
                    None => trace!(len = payload.len(), "unparsable transfer speed"),
                }
            });
        match rate {
            Ok(token) => streams.push((EventType::VideoTransferSpeed, token)),
            Err(e) => {
                if let Err(undo) = self.bridge.remove_event_type_listener(EventType::VideoDataRecv, data) {
                    debug!(error = %undo, "frame listener already gone");
                }
                streams.clear();
                return Err(e);
            }
        }

        debug!("camera started");
        Ok(())
    }

    /// Stop recording, drop every frame callback and unsubscribe from the
    /// streams.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotStarted`] if not started.
    pub fn stop(&self) -> Result<(), BridgeError> {
        let streams: Vec<(EventType, Token)> = {
            let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            if streams.is_empty() {
                return Err(BridgeError::NotStarted);
            }
            streams.drain(..).collect()
        };

        let recording = self.recording.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(token) = recording {
            self.forget_recording_listener(token);
        }

        if !self.frames.clear().is_empty() {
            self.send_video_event(EventType::StopVideo);
        }

        for (event_type, token) in streams {
            if let Err(e) = self.bridge.remove_event_type_listener(event_type, token) {
                debug!(%event_type, error = %e, "stream listener already gone");
            }
        }
        debug!("camera stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        !self.streams.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    // ─── Video stream ──────────────────────────────────────────────────────

    /// Register `callback` for decoded frames, starting the stream if this
    /// is the first one.
    pub fn add_video_callback<F>(&self, callback: F) -> Result<Token, BridgeError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.frames.add((), Arc::new(callback), || {
            self.bridge.send_event(&Event::new(EventType::StartVideo))
        })
    }

    /// # Errors
    ///
    /// [`BridgeError::NotFound`] for an unknown token.
    pub fn remove_video_callback(&self, token: Token) -> Result<(), BridgeError> {
        self.frames
            .remove((), token, || self.send_video_event(EventType::StopVideo))
    }

    pub fn video_callback_count(&self) -> usize {
        self.frames.count(())
    }

    /// Last reported video link throughput, if any.
    pub fn video_transfer_speed(&self) -> Option<f64> {
        self.transfer_speed.load_full().map(|s| *s)
    }

    // ─── Settings ──────────────────────────────────────────────────────────

    pub fn mode(&self) -> Result<CameraMode, BridgeError> {
        CameraMode::from_raw(self.read_uint(keys::CAMERA_MODE)?)
    }

    pub fn set_mode(&self, mode: CameraMode) -> Result<(), BridgeError> {
        self.bridge.set_key_value_sync(keys::CAMERA_MODE, mode.raw())
    }

    pub fn video_format(&self) -> Result<u64, BridgeError> {
        self.read_uint(keys::CAMERA_VIDEO_FORMAT)
    }

    pub fn set_video_format(&self, format: u64) -> Result<(), BridgeError> {
        self.bridge.set_key_value_sync(keys::CAMERA_VIDEO_FORMAT, format)
    }

    /// Video bitrate, in Mbps.
    pub fn video_quality(&self) -> Result<f64, BridgeError> {
        let value = self.bridge.get_key_value_sync(keys::CAMERA_VIDEO_TRANS_RATE, false)?;
        value.as_f64().ok_or_else(|| unexpected(keys::CAMERA_VIDEO_TRANS_RATE.name(), &value))
    }

    pub fn set_video_quality(&self, mbps: f64) -> Result<(), BridgeError> {
        self.bridge.set_key_value_sync(keys::CAMERA_VIDEO_TRANS_RATE, mbps)
    }

    pub fn digital_zoom_factor(&self) -> Result<u64, BridgeError> {
        self.read_uint(keys::CAMERA_DIGITAL_ZOOM_FACTOR)
    }

    pub fn set_digital_zoom_factor(&self, factor: u64) -> Result<(), BridgeError> {
        self.bridge.set_key_value_sync(keys::CAMERA_DIGITAL_ZOOM_FACTOR, factor)
    }

    // ─── Capture ───────────────────────────────────────────────────────────

    /// Take a picture, switching to photo mode first if needed.
    pub fn shoot_photo(&self) -> Result<(), BridgeError> {
        self.ensure_mode(CameraMode::Photo)?;
        self.bridge.perform_action_sync(keys::CAMERA_START_SHOOT_PHOTO, None)?;
        info!("photo taken");
        Ok(())
    }

    /// Start recording, switching to video mode first if needed, and track
    /// the elapsed recording time.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AlreadyStarted`] if already recording.
    pub fn start_recording_video(&self) -> Result<(), BridgeError> {
        let mut recording = self.recording.lock().unwrap_or_else(PoisonError::into_inner);
        if recording.is_some() {
            return Err(BridgeError::AlreadyStarted);
        }

        self.ensure_mode(CameraMode::Video)?;
        self.bridge.perform_action_sync(keys::CAMERA_START_RECORD_VIDEO, None)?;

        self.recording_time.store(Arc::new(Duration::ZERO));
        let elapsed = Arc::clone(&self.recording_time);
        let token = self.bridge.add_key_listener(
            keys::CAMERA_CURRENT_RECORDING_TIME_IN_SECONDS,
            move |result: &KeyResult| {
                if let Some(secs) = result.value().as_u64() {
                    elapsed.store(Arc::new(Duration::from_secs(secs)));
                }
            },
            true,
        )?;
        *recording = Some(token);
        info!("recording started");
        Ok(())
    }

    /// # Errors
    ///
    /// [`BridgeError::NotStarted`] if not recording.
    pub fn stop_recording_video(&self) -> Result<(), BridgeError> {
        let mut recording = self.recording.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(token) = *recording else {
            return Err(BridgeError::NotStarted);
        };

        self.bridge.perform_action_sync(keys::CAMERA_STOP_RECORD_VIDEO, None)?;
        self.forget_recording_listener(token);
        *recording = None;
        info!(elapsed = ?self.recording_time(), "recording stopped");
        Ok(())
    }

    pub fn is_recording_video(&self) -> bool {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Elapsed time of the current (or last) recording.
    pub fn recording_time(&self) -> Duration {
        **self.recording_time.load()
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    fn ensure_mode(&self, wanted: CameraMode) -> Result<(), BridgeError> {
        if self.mode()? != wanted {
            debug!(?wanted, "switching camera mode");
            self.set_mode(wanted)?;
        }
        Ok(())
    }

    fn read_uint(&self, key: Key) -> Result<u64, BridgeError> {
        let value = self.bridge.get_key_value_sync(key, false)?;
        value.as_u64().ok_or_else(|| unexpected(key.name(), &value))
    }

    fn forget_recording_listener(&self, token: Token) {
        if let Err(e) = self
            .bridge
            .remove_key_listener(keys::CAMERA_CURRENT_RECORDING_TIME_IN_SECONDS, token)
        {
            debug!(error = %e, "recording time listener already gone");
        }
    }

    fn send_video_event(&self, event_type: EventType) {
        if let Err(e) = self.bridge.send_event(&Event::new(event_type)) {
            warn!(%event_type, error = %e, "could not send video event");
        }
    }
}

fn unexpected(key: &str, value: &Value) -> BridgeError {
    BridgeError::Decode(format!("unexpected value {value:?} for {key}"))
}

fn parse_speed(payload: &[u8]) -> Option<f64> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmbridge_middleware::BridgeConfig;
    use rmbridge_native::sim::SimulatedBridge;
    use serde_json::json;
    use std::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn camera(sim: SimulatedBridge) -> Result<(Arc<SimulatedBridge>, Camera), BridgeError> {
        let sim = Arc::new(sim);
        let bridge = Bridge::new(sim.clone(), BridgeConfig::default());
        bridge.start()?;
        let camera = Camera::new(bridge);
        camera.start()?;
        Ok((sim, camera))
    }

    #[test]
    fn video_stream_follows_callback_count() -> Result<(), Box<dyn Error>> {
        let (sim, camera) = camera(SimulatedBridge::new())?;
        let frames = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&frames);
        let first = camera.add_video_callback(move |frame| {
            assert_eq!(frame, b"frame");
            f.fetch_add(1, Ordering::SeqCst);
        })?;
        let f = Arc::clone(&frames);
        let second = camera.add_video_callback(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        })?;
        assert!(sim.is_streaming_video());

        sim.push_video_frame(b"frame");
        sim.flush();
        assert_eq!(frames.load(Ordering::SeqCst), 2);

        camera.remove_video_callback(first)?;
        assert!(sim.is_streaming_video());
        camera.remove_video_callback(second)?;
        assert!(!sim.is_streaming_video());

        let starts = sim
            .sent_events()
            .iter()
            .filter(|e| e.event_type() == EventType::StartVideo.code())
            .count();
        assert_eq!(starts, 1);
        Ok(())
    }

    #[test]
    fn stop_tears_down_stream_and_listeners() -> Result<(), Box<dyn Error>> {
        let (sim, camera) = camera(SimulatedBridge::new())?;
        camera.add_video_callback(|_| {})?;
        assert!(sim.callback_enabled(EventType::VideoDataRecv));

        camera.stop()?;
        assert!(!sim.is_streaming_video());
        assert!(!sim.callback_enabled(EventType::VideoDataRecv));
        assert_eq!(camera.video_callback_count(), 0);
        assert!(matches!(camera.stop(), Err(BridgeError::NotStarted)));
        Ok(())
    }

    #[test]
    fn settings_round_trip_through_device() -> Result<(), Box<dyn Error>> {
        let sim = SimulatedBridge::new()
            .with_value(keys::CAMERA_VIDEO_FORMAT, json!(2))
            .with_value(keys::CAMERA_DIGITAL_ZOOM_FACTOR, json!(1))
            .with_value(keys::CAMERA_VIDEO_TRANS_RATE, json!(4.0));
        let (sim, camera) = camera(sim)?;

        assert_eq!(camera.mode()?, CameraMode::Photo);
        camera.set_mode(CameraMode::Video)?;
        assert_eq!(camera.mode()?, CameraMode::Video);

        assert_eq!(camera.video_format()?, 2);
        camera.set_video_format(5)?;
        assert_eq!(sim.value(keys::CAMERA_VIDEO_FORMAT), Some(json!(5)));

        camera.set_digital_zoom_factor(3)?;
        assert_eq!(camera.digital_zoom_factor()?, 3);

        camera.set_video_quality(8.5)?;
        assert_eq!(camera.video_quality()?, 8.5);
        Ok(())
    }

    #[test]
    fn recording_tracks_elapsed_time() -> Result<(), Box<dyn Error>> {
        let sim = SimulatedBridge::new().with_value(keys::CAMERA_CURRENT_RECORDING_TIME_IN_SECONDS, json!(0));
        let (sim, camera) = camera(sim)?;

        camera.start_recording_video()?;
        assert!(camera.is_recording_video());
        assert_eq!(sim.value(keys::CAMERA_MODE), Some(json!(1)));
        assert!(matches!(camera.start_recording_video(), Err(BridgeError::AlreadyStarted)));

        sim.set_value(keys::CAMERA_CURRENT_RECORDING_TIME_IN_SECONDS, json!(12));
        sim.flush();
        assert_eq!(camera.recording_time(), Duration::from_secs(12));

        camera.stop_recording_video()?;
        assert!(!camera.is_recording_video());
        assert_eq!(sim.listen_stops(keys::CAMERA_CURRENT_RECORDING_TIME_IN_SECONDS), 1);
        assert_eq!(camera.recording_time(), Duration::from_secs(12));
        assert!(matches!(camera.stop_recording_video(), Err(BridgeError::NotStarted)));
        Ok(())
    }

    #[test]
    fn photo_switches_back_to_photo_mode() -> Result<(), Box<dyn Error>> {
        let sim = SimulatedBridge::new().with_value(keys::CAMERA_MODE, json!(1));
        let (sim, camera) = camera(sim)?;
        camera.shoot_photo()?;
        assert_eq!(sim.value(keys::CAMERA_MODE), Some(json!(0)));
        Ok(())
    }

    #[test]
    fn transfer_speed_is_parsed_from_text() -> Result<(), Box<dyn Error>> {
        let (sim, camera) = camera(SimulatedBridge::new())?;
        assert_eq!(camera.video_transfer_speed(), None);
        sim.emit(Event::new(EventType::VideoTransferSpeed).code(), b"3.25", 0);
        sim.flush();
        assert_eq!(camera.video_transfer_speed(), Some(3.25));
        Ok(())
    }

    #[test]
    fn unknown_mode_is_a_decode_error() {
        assert!(matches!(CameraMode::from_raw(9), Err(BridgeError::Decode(_))));
        assert_eq!(CameraMode::from_raw(1).ok(), Some(CameraMode::Video));
    }
}
