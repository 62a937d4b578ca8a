//! Capability negotiation
//!
//! Loads the router's RTP capabilities into a fresh device once per
//! connection. Duplicate capability messages (a racing reconnect, a server
//! retry) must never reload or crash the session.

use crate::engine::{Device, DeviceFactory, EngineError, RtpCapabilities};
use log::{debug, info, warn};
use std::sync::Arc;

/// Load progress of the session device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPhase {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// What to do with an incoming `routerRtpCapabilities`
pub enum LoadStep {
    /// Load `capabilities` into `device` (off the event loop)
    Load {
        device: Arc<dyn Device>,
        capabilities: RtpCapabilities,
    },
    /// A load is already running; drop the duplicate
    InProgress,
    /// The device is loaded already
    AlreadyLoaded,
}

/// Owns the session device and its load state
#[derive(Default)]
pub struct CapabilityNegotiator {
    device: Option<Arc<dyn Device>>,
    phase: LoadPhase,
}

impl CapabilityNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide how to handle a capabilities message, creating the device if needed
    pub fn begin_load(
        &mut self,
        factory: &dyn DeviceFactory,
        capabilities: RtpCapabilities,
    ) -> Result<LoadStep, EngineError> {
        match self.phase {
            LoadPhase::Loading => {
                debug!("Device load already in progress, ignoring duplicate capabilities");
                return Ok(LoadStep::InProgress);
            }
            LoadPhase::Loaded => {
                debug!("Device already loaded, ignoring duplicate capabilities");
                return Ok(LoadStep::AlreadyLoaded);
            }
            LoadPhase::Unloaded | LoadPhase::Failed => {}
        }

        let device = match &self.device {
            Some(device) => device.clone(),
            None => {
                let device = factory.create_device()?;
                self.device = Some(device.clone());
                device
            }
        };

        if device.loaded() {
            self.phase = LoadPhase::Loaded;
            return Ok(LoadStep::AlreadyLoaded);
        }

        self.phase = LoadPhase::Loading;
        Ok(LoadStep::Load { device, capabilities })
    }

    /// Record the outcome of a load started by `begin_load`
    pub fn finish_load(&mut self, result: Result<(), EngineError>) -> Result<(), EngineError> {
        match result {
            Ok(()) => {
                self.phase = LoadPhase::Loaded;
                info!("Device loaded with router capabilities");
                Ok(())
            }
            Err(e) => {
                self.phase = LoadPhase::Failed;
                warn!("Device load failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    pub fn loaded(&self) -> bool {
        self.phase == LoadPhase::Loaded
    }

    /// The loaded device
    pub fn device(&self) -> Option<Arc<dyn Device>> {
        if self.loaded() {
            self.device.clone()
        } else {
            None
        }
    }

    /// Receive capabilities sent with every `consume`
    pub fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.device().and_then(|device| device.rtp_capabilities())
    }

    /// Forget the device
    pub fn reset(&mut self) {
        self.device = None;
        self.phase = LoadPhase::Unloaded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::synthetic::SyntheticDeviceFactory;
    use serde_json::json;

    async fn run_step(negotiator: &mut CapabilityNegotiator, step: LoadStep) {
        if let LoadStep::Load { device, capabilities } = step {
            let result = device.load(capabilities).await;
            let _ = negotiator.finish_load(result);
        }
    }

    #[tokio::test]
    async fn test_duplicate_capabilities_load_once() {
        let factory = SyntheticDeviceFactory::new();
        let mut negotiator = CapabilityNegotiator::new();

        let first = negotiator.begin_load(&*factory, json!({ "codecs": [] })).unwrap();
        // A duplicate arriving mid-load is dropped
        let racing = negotiator.begin_load(&*factory, json!({ "codecs": [] })).unwrap();
        assert!(matches!(racing, LoadStep::InProgress));

        run_step(&mut negotiator, first).await;
        assert!(negotiator.loaded());

        let after = negotiator.begin_load(&*factory, json!({ "codecs": [] })).unwrap();
        assert!(matches!(after, LoadStep::AlreadyLoaded));

        let devices = factory.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].load_count(), 1);
        assert!(negotiator.rtp_capabilities().is_some());
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let factory = SyntheticDeviceFactory::new();
        let mut negotiator = CapabilityNegotiator::new();

        let step = negotiator.begin_load(&*factory, json!("bogus")).unwrap();
        let LoadStep::Load { device, capabilities } = step else {
            panic!("expected a load step");
        };
        let result = device.load(capabilities).await;
        assert!(negotiator.finish_load(result).is_err());
        assert_eq!(negotiator.phase(), LoadPhase::Failed);
        assert!(negotiator.device().is_none());

        negotiator.reset();
        assert_eq!(negotiator.phase(), LoadPhase::Unloaded);
    }
}
