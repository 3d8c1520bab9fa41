//! The operator-facing application state.
//!
//! `PactApp` is what a front end talks to. It mirrors the controls of the
//! instrument panel: a discover button, a device list with a selection, a
//! duration field with start/stop buttons. Every operation returns either a
//! result for display or a [`PactError`](crate::error::PactError) whose
//! `Display` is the message to show.

use crate::channel::SharedChannel;
use crate::config::PactConfig;
use crate::controller::{ControllerConfig, TestController};
use crate::discovery::{Device, DiscoveryConfig, DiscoveryService, DiscoverySession};
use crate::error::{AppResult, ValidationError};
use crate::plot::PlotSink;
use crate::session::{SessionState, TestSession};
use std::sync::Arc;
use tracing::info;

/// Discovery results, selection and test control over one shared channel.
#[derive(Debug)]
pub struct PactApp {
    channel: SharedChannel,
    discovery: DiscoveryService,
    devices: DiscoverySession,
    selected: Option<usize>,
    controller: TestController,
}

impl PactApp {
    /// Assemble an app over an already open channel.
    pub fn new(
        channel: SharedChannel,
        discovery: DiscoveryConfig,
        controller: ControllerConfig,
        sink: Arc<dyn PlotSink>,
    ) -> Self {
        Self {
            controller: TestController::new(channel.clone(), controller, sink),
            discovery: DiscoveryService::new(discovery),
            devices: DiscoverySession::default(),
            selected: None,
            channel,
        }
    }

    /// Open the multicast channel described by `config` and assemble an app.
    pub fn from_config(config: &PactConfig, sink: Arc<dyn PlotSink>) -> AppResult<Self> {
        let channel = SharedChannel::open(&config.multicast_config())?;
        Ok(Self::new(
            channel,
            config.discovery_config(),
            config.controller_config(),
            sink,
        ))
    }

    /// Run discovery, replace the device list and clear the selection.
    ///
    /// Returns the new list as display strings.
    pub async fn discover(&mut self) -> AppResult<Vec<String>> {
        let devices = self.discovery.discover(&self.channel).await?;
        self.devices = devices;
        self.selected = None;
        Ok(self.device_list())
    }

    /// Select the device at `index` of the current list.
    pub fn select_device(&mut self, index: usize) -> AppResult<&Device> {
        let count = self.devices.len();
        let device = self
            .devices
            .get(index)
            .ok_or(ValidationError::DeviceIndexOutOfRange { index, count })?;
        self.selected = Some(index);
        info!(index, device = %device, "Device selected");
        Ok(device)
    }

    /// Currently selected device.
    pub fn selected_device(&self) -> Option<&Device> {
        self.selected.and_then(|index| self.devices.get(index))
    }

    /// Start a test of `duration_text` seconds on the selected device.
    pub async fn start_test(&mut self, duration_text: &str) -> AppResult<()> {
        let device = self.selected.and_then(|index| self.devices.get(index));
        self.controller.start_test(device, duration_text).await
    }

    /// Stop the test on the selected device.
    pub async fn stop_test(&mut self) -> AppResult<()> {
        let device = self.selected.and_then(|index| self.devices.get(index));
        self.controller.stop_test(device).await
    }

    /// `"<model>, port=<port>"` for each discovered device.
    pub fn device_list(&self) -> Vec<String> {
        self.devices.display_lines()
    }

    /// Result of the last discovery.
    pub fn devices(&self) -> &DiscoverySession {
        &self.devices
    }

    /// Current test state.
    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    /// Snapshot of the current (or most recent) session.
    pub fn session(&self) -> Option<TestSession> {
        self.controller.session()
    }

    /// The test controller, for live session access.
    pub fn controller(&self) -> &TestController {
        &self.controller
    }

    /// Stop ingestion and close the channel. Nothing is sent to the device.
    pub async fn close(&mut self) {
        self.controller.shutdown().await;
        self.channel.close();
        info!("Application closed");
    }
}
