//! Host runtime model: the dashboard state surface the API serves.
//!
//! Provides the device (features and change triggers), the screen (popups,
//! interactions, printing flag), the element register, and the shorthand
//! action registry. [`Runtime`] ties them into one explicit context object
//! that is built once and shared by `Arc` with every API component.

pub mod actions;
pub mod device;
pub mod element;
pub mod screen;
pub mod simulated;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use actions::{
    sync_handler, ActionError, ActionFn, ActionRegistry, GroupResolver, RegisteredAction,
};
pub use device::{
    BacklightBehaviour, BacklightState, BatteryState, ChargeState, Device, DeviceConfig,
    DeviceDescriptor, DevicePlatform, FeatureError, FeatureKind, FeatureWatch, NetworkState,
};
pub use element::{Element, ElementError, ElementRegistry};
pub use screen::{MainElement, Screen, ScreenError, TouchAction, TouchEvent};
pub use simulated::SimulatedPlatform;

/// The host runtime context.
///
/// Owns every registry the API reads. Constructed in `main` (or per test) and
/// never behind a global.
pub struct Runtime {
    name: String,
    version: &'static str,
    start_time: DateTime<Utc>,
    integrations: Vec<String>,
    device: Device,
    screen: Screen,
    elements: ElementRegistry,
    actions: ActionRegistry,
}

impl Runtime {
    pub fn new(name: impl Into<String>, platform: Arc<dyn DevicePlatform>) -> Self {
        Runtime {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION"),
            start_time: Utc::now(),
            integrations: Vec::new(),
            device: Device::new(platform),
            screen: Screen::new(),
            elements: ElementRegistry::new(),
            actions: ActionRegistry::new(),
        }
    }

    /// A runtime backed by the simulated desktop platform.
    pub fn simulated(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(SimulatedPlatform::new()))
    }

    /// Record a loaded integration, reported in the REST config snapshot.
    pub fn with_integration(mut self, name: impl Into<String>) -> Self {
        self.integrations.push(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The inkBoard version reported to clients.
    pub fn version(&self) -> &'static str {
        self.version
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn integrations(&self) -> &[String] {
        &self.integrations
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn elements(&self) -> &ElementRegistry {
        &self.elements
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }
}
