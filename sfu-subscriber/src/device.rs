//! Media device abstraction and router capability negotiation

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::signaling::messages::TransportParameters;
use crate::transport::RecvTransport;

/// Creates media devices.
///
/// Fails with [`Error::UnsupportedEnvironment`] when no engine can run here.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn MediaDevice>>;
}

/// Client-side media engine instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Load the router's RTP capabilities. A device can be loaded once.
    async fn load(&self, router_rtp_capabilities: Value) -> Result<()>;

    /// The device's own receive capabilities, available once loaded
    fn rtp_capabilities(&self) -> Option<Value>;

    async fn create_recv_transport(
        &self,
        params: TransportParameters,
    ) -> Result<Arc<dyn RecvTransport>>;
}

/// Owns the device of the current session
pub struct CapabilityNegotiator {
    factory: Arc<dyn DeviceFactory>,
    device: RwLock<Option<Arc<dyn MediaDevice>>>,
}

impl CapabilityNegotiator {
    pub fn new(factory: Arc<dyn DeviceFactory>) -> Self {
        Self {
            factory,
            device: RwLock::new(None),
        }
    }

    /// Create a fresh device and load `router_rtp_capabilities` into it.
    ///
    /// Any previously loaded device is replaced only on success.
    pub async fn load_device(
        &self,
        router_rtp_capabilities: Value,
    ) -> Result<Arc<dyn MediaDevice>> {
        let device = match self.factory.create() {
            Ok(device) => device,
            Err(err @ Error::UnsupportedEnvironment(_)) => {
                error!(error = %err, "media engine not supported in this environment");
                return Err(err);
            }
            Err(err) => {
                warn!(error = %err, "failed to create media device");
                return Err(err);
            }
        };

        if let Err(err) = device.load(router_rtp_capabilities).await {
            if err.is_terminal() {
                error!(error = %err, "media engine not supported in this environment");
            } else {
                warn!(error = %err, "failed to load router capabilities");
            }
            return Err(err);
        }

        *self.device.write() = Some(device.clone());
        info!("media device loaded with router capabilities");
        Ok(device)
    }

    #[must_use]
    pub fn device(&self) -> Option<Arc<dyn MediaDevice>> {
        self.device.read().clone()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.device.read().is_some()
    }

    /// The loaded device's receive capabilities
    #[must_use]
    pub fn rtp_capabilities(&self) -> Option<Value> {
        self.device.read().as_ref()?.rtp_capabilities()
    }

    /// Drop the device so the next session negotiates again
    pub fn reset(&self) {
        self.device.write().take();
    }
}
