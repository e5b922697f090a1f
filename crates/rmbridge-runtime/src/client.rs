//! [`Client`] – one handle over the bridge, the connection and the
//! feature modules.
//!
//! `start` brings the parts up in dependency order (bridge, connection,
//! camera) and unwinds what it already started if a later part fails.
//! `stop` tears them down in reverse.

use std::sync::Arc;

use rmbridge_middleware::Bridge;
use rmbridge_native::{LibraryBridge, NativeBridge};
use rmbridge_types::BridgeError;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::camera::Camera;
use crate::config::ClientConfig;
use crate::connection::Connection;

pub struct Client {
    bridge: Bridge,
    connection: Connection,
    camera: Camera,
    // Serialises start/stop; `true` while started.
    started: Mutex<bool>,
}

impl Client {
    pub fn new(native: Arc<dyn NativeBridge>, config: &ClientConfig) -> Self {
        let bridge = Bridge::new(native, config.bridge_config());
        Self {
            connection: Connection::new(bridge.clone(), config.connection_config()),
            camera: Camera::new(bridge.clone()),
            bridge,
            started: Mutex::new(false),
        }
    }

    /// Load the native library named in `config`, or the platform default.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Native`] if the library cannot be loaded.
    pub fn from_config(config: &ClientConfig) -> Result<Self, BridgeError> {
        let library = match &config.library_path {
            Some(path) => LibraryBridge::load(path)?,
            None => LibraryBridge::load_default()?,
        };
        Ok(Self::new(Arc::new(library), config))
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub async fn is_started(&self) -> bool {
        *self.started.lock().await
    }

    /// # Errors
    ///
    /// [`BridgeError::AlreadyStarted`], or the first part that failed to
    /// come up. Parts already started are stopped again in that case.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut started = self.started.lock().await;
        if *started {
            return Err(BridgeError::AlreadyStarted);
        }

        self.bridge.start()?;

        if let Err(e) = self.connection.start().await {
            self.stop_bridge();
            return Err(e);
        }

        if let Err(e) = self.camera.start() {
            if let Err(stop) = self.connection.stop().await {
                warn!(error = %stop, "connection stop during unwind failed");
            }
            self.stop_bridge();
            return Err(e);
        }

        *started = true;
        info!("client started");
        Ok(())
    }

    /// Every part is stopped even if an earlier one fails; the first
    /// failure is returned.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotStarted`], or the first teardown failure.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let mut started = self.started.lock().await;
        if !*started {
            return Err(BridgeError::NotStarted);
        }

        let camera = self.camera.stop();
        let connection = self.connection.stop().await;
        let bridge = self.bridge.stop();
        *started = false;

        let mut first = None;
        for (part, result) in [("camera", camera), ("connection", connection), ("bridge", bridge)] {
            if let Err(e) = result {
                warn!(part, error = %e, "stop failed");
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => {
                info!("client stopped");
                Ok(())
            }
        }
    }

    fn stop_bridge(&self) {
        if let Err(e) = self.bridge.stop() {
            warn!(error = %e, "bridge stop during unwind failed");
        }
    }
}
