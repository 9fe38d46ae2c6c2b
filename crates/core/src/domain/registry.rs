//! Virtual device registry
//!
//! Owns the set of virtual sinks and sources that should exist and performs
//! name-based upserts against the live graph. Removal is never automatic.

use crate::domain::audio::{
    AudioError, ChannelCount, DeviceKind, Result, SampleRate, VirtualDevice,
};
use crate::domain::graph::{with_timeout, AudioServer, NodeClass, NodeInfo};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What [`VirtualDeviceRegistry::ensure_device_in`] found or did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Created,
    Existing,
    /// Present under the right name and class but with other parameters
    Mismatched { channels: u16, sample_rate: u32 },
}

impl EnsureOutcome {
    pub fn existed(&self) -> bool {
        !matches!(self, EnsureOutcome::Created)
    }
}

/// Tracks and upserts the intercom virtual devices
pub struct VirtualDeviceRegistry {
    server: Arc<dyn AudioServer>,
    call_timeout: Duration,
    speaker: VirtualDevice,
    microphone: VirtualDevice,
}

impl VirtualDeviceRegistry {
    pub fn new(
        server: Arc<dyn AudioServer>,
        call_timeout: Duration,
        speaker: VirtualDevice,
        microphone: VirtualDevice,
    ) -> Self {
        Self {
            server,
            call_timeout,
            speaker,
            microphone,
        }
    }

    pub fn speaker(&self) -> &VirtualDevice {
        &self.speaker
    }

    pub fn microphone(&self) -> &VirtualDevice {
        &self.microphone
    }

    /// Desired devices, in creation order
    pub fn desired(&self) -> [&VirtualDevice; 2] {
        [&self.speaker, &self.microphone]
    }

    /// Ensure a device exists; returns whether it already did
    #[instrument(skip(self, spec), fields(device = %spec.name))]
    pub async fn ensure_device(&self, spec: &VirtualDevice) -> Result<bool> {
        let nodes = with_timeout(self.call_timeout, "list nodes", self.server.list_nodes())
            .await
            .map_err(|e| match e {
                AudioError::Timeout { .. } => AudioError::backend_unavailable(e.to_string()),
                other => other,
            })?;
        Ok(self.ensure_device_in(spec, &nodes).await?.existed())
    }

    /// Ensure a device exists, given an already enumerated node list
    pub async fn ensure_device_in(
        &self,
        spec: &VirtualDevice,
        nodes: &[NodeInfo],
    ) -> Result<EnsureOutcome> {
        spec.validate()?;

        let class = spec.kind.node_class();
        if let Some(node) = nodes.iter().find(|n| n.name == spec.name && n.class == class) {
            if node.channels != spec.channels.count() || node.sample_rate != spec.sample_rate.hz() {
                warn!(
                    device = %spec.name,
                    channels = node.channels,
                    rate = node.sample_rate,
                    "Virtual device exists with unexpected parameters; leaving it in place"
                );
                return Ok(EnsureOutcome::Mismatched {
                    channels: node.channels,
                    sample_rate: node.sample_rate,
                });
            }
            debug!(device = %spec.name, "Virtual device already present");
            return Ok(EnsureOutcome::Existing);
        }

        let module = with_timeout(
            self.call_timeout,
            "create virtual device",
            self.server.create_virtual_device(spec),
        )
        .await
        .map_err(|e| AudioError::DeviceCreateFailed {
            name: spec.name.clone(),
            reason: e.to_string(),
        })?;

        info!(
            device = %spec.name,
            kind = %spec.kind,
            channels = spec.channels.count(),
            rate = spec.sample_rate.hz(),
            module,
            "Created virtual device"
        );
        Ok(EnsureOutcome::Created)
    }

    /// Nodes that carry a desired device's name under the wrong class
    ///
    /// The microphone must be a source; a sink with its name (and that
    /// sink's monitor) is a leftover from an older setup.
    pub fn conflicts<'a>(&self, nodes: &'a [NodeInfo]) -> Vec<&'a NodeInfo> {
        self.desired()
            .into_iter()
            .flat_map(|spec| {
                let wrong = match spec.kind {
                    DeviceKind::Sink => NodeClass::Source,
                    DeviceKind::Source => NodeClass::Sink,
                };
                nodes
                    .iter()
                    .filter(move |n| n.name == spec.name && n.class == wrong)
            })
            .collect()
    }

    /// Read a device's live parameters back from the audio server
    pub async fn describe(&self, name: &str) -> Result<VirtualDevice> {
        let nodes =
            with_timeout(self.call_timeout, "list nodes", self.server.list_nodes()).await?;
        let node = nodes
            .iter()
            .find(|n| n.name == name && n.class != NodeClass::Monitor)
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))?;
        let kind = node
            .kind()
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))?;

        let mut device = VirtualDevice::new(name, kind, ChannelCount::try_from(node.channels)?);
        device.sample_rate = SampleRate::from_hz(node.sample_rate);
        if let Some(desc) = node.property("device.description") {
            device.description = desc.to_string();
        }
        Ok(device)
    }

    /// Explicit administrative removal
    #[instrument(skip(self))]
    pub async fn remove_device(&self, name: &str, kind: DeviceKind) -> Result<()> {
        with_timeout(
            self.call_timeout,
            "remove virtual device",
            self.server.remove_virtual_device(name, kind),
        )
        .await?;
        info!(device = name, kind = %kind, "Removed virtual device");
        Ok(())
    }
}
