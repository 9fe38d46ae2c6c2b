//! In-memory audio server
//!
//! A faithful-enough simulation of the audio-server graph: null sinks come
//! with a monitor source, virtual sources do not, loopbacks attach module-owned
//! streams to both endpoints and survive the disappearance of their hardware
//! endpoint (the reconciler has to clean them up). Failures, timeouts and an
//! unreachable server can be injected. Used by tests and by `--dry-run`.

use crate::domain::audio::{AudioError, DeviceKind, HardwareIdentity, Result, VirtualDevice};
use crate::domain::graph::{
    AudioServer, EndpointState, LinkKey, LoopbackInfo, NodeClass, NodeInfo, StreamDirection,
    StreamInfo,
};
use crate::domain::policy::PolicyDocument;
use crate::domain::router::LoopbackLink;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// USB ids of the intercom headset the appliance ships with
pub const HEADSET_VENDOR_ID: &str = "0573";
pub const HEADSET_PRODUCT_ID: &str = "1573";

const HEADSET_OUTPUT: &str = "alsa_output.usb-CSCTEK_USB_Audio_and_HID_A34004801402-00.analog-stereo";
const HEADSET_INPUT: &str = "alsa_input.usb-CSCTEK_USB_Audio_and_HID_A34004801402-00.mono-fallback";

#[derive(Debug, Default)]
struct MemoryGraph {
    nodes: Vec<NodeInfo>,
    loopbacks: Vec<LoopbackInfo>,
    streams: Vec<StreamInfo>,
    endpoints: HashMap<(String, DeviceKind), EndpointState>,
    peaks: HashMap<String, f32>,
    policy: Option<PolicyDocument>,
    policy_writes: usize,
    device_creates: usize,
    link_creates: usize,
    next_index: u32,
    unreachable: bool,
    delay: Option<Duration>,
    failing_devices: HashSet<String>,
    failing_links: HashSet<LinkKey>,
}

impl MemoryGraph {
    fn next_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn has_node(&self, name: &str, class: NodeClass) -> bool {
        self.nodes.iter().any(|n| n.name == name && n.class == class)
    }

    fn drop_nodes_where(&mut self, pred: impl Fn(&NodeInfo) -> bool) {
        let removed: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| pred(n))
            .map(|n| n.name.clone())
            .collect();
        self.nodes.retain(|n| !pred(n));
        self.streams
            .retain(|s| !removed.contains(&s.target) || s.owner_module.is_some());
    }
}

/// Audio server backed by an in-process graph
#[derive(Debug, Default)]
pub struct InMemoryAudioServer {
    graph: Mutex<MemoryGraph>,
}

impl InMemoryAudioServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bare appliance: two HDMI outputs, no headset
    pub fn appliance() -> Self {
        let server = Self::new();
        server.add_node(
            NodeInfo::hardware("alsa_output.pci-0000_00_1f.3.hdmi-stereo", NodeClass::Sink)
                .with_property("device.api", "alsa")
                .with_port("hdmi-output-0"),
        );
        server.add_node(
            NodeInfo::hardware(
                "alsa_output.pci-0000_00_1f.3.hdmi-stereo-extra1",
                NodeClass::Sink,
            )
            .with_property("device.api", "alsa")
            .with_port("hdmi-output-1"),
        );
        server
    }

    fn graph(&self) -> MutexGuard<'_, MemoryGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self) -> Result<()> {
        let (unreachable, delay) = {
            let graph = self.graph();
            (graph.unreachable, graph.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(AudioError::backend_unavailable("connection refused"));
        }
        Ok(())
    }

    pub fn add_node(&self, mut node: NodeInfo) {
        let mut graph = self.graph();
        node.index = graph.next_index();
        if node.class == NodeClass::Sink && node.owner_module.is_none() {
            let monitor = NodeInfo {
                index: graph.next_index(),
                name: format!("{}.monitor", node.name),
                class: NodeClass::Monitor,
                ..node.clone()
            };
            graph.nodes.push(monitor);
        }
        graph.nodes.push(node);
    }

    /// Plug in the intercom USB headset
    pub fn plug_headset(&self) {
        let tag = |node: NodeInfo| {
            node.with_property("device.api", "alsa")
                .with_property("device.bus", "usb")
                .with_property("device.vendor.id", &format!("0x{}", HEADSET_VENDOR_ID))
                .with_property("device.product.id", &format!("0x{}", HEADSET_PRODUCT_ID))
        };
        self.add_node(tag(NodeInfo::hardware(HEADSET_OUTPUT, NodeClass::Sink)));
        let mut input = tag(NodeInfo::hardware(HEADSET_INPUT, NodeClass::Source));
        input.channels = 1;
        self.add_node(input);
    }

    /// Pull the intercom USB headset
    pub fn unplug_headset(&self) {
        let identity = HardwareIdentity::usb(HEADSET_VENDOR_ID, HEADSET_PRODUCT_ID);
        self.graph().drop_nodes_where(|n| identity.matches(n) || n.name.starts_with(HEADSET_OUTPUT));
    }

    pub fn headset_output(&self) -> &'static str {
        HEADSET_OUTPUT
    }

    pub fn headset_input(&self) -> &'static str {
        HEADSET_INPUT
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.graph().unreachable = unreachable;
    }

    /// Delay every call, to exercise deadlines
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.graph().delay = delay;
    }

    pub fn fail_device(&self, name: &str) {
        self.graph().failing_devices.insert(name.to_string());
    }

    pub fn fail_link(&self, key: LinkKey) {
        self.graph().failing_links.insert(key);
    }

    pub fn clear_failures(&self) {
        let mut graph = self.graph();
        graph.failing_devices.clear();
        graph.failing_links.clear();
    }

    /// Attach a client stream, returning its index
    pub fn open_stream(
        &self,
        application: &str,
        binary: Option<&str>,
        direction: StreamDirection,
        target: &str,
    ) -> u32 {
        let mut graph = self.graph();
        let index = graph.next_index();
        graph.streams.push(StreamInfo {
            index,
            direction,
            application: application.to_string(),
            binary: binary.map(str::to_string),
            target: target.to_string(),
            owner_module: None,
        });
        index
    }

    pub fn set_peak(&self, name: &str, peak: f32) {
        self.graph().peaks.insert(name.to_string(), peak);
    }

    /// Insert a loopback module behind the router's back
    pub fn inject_loopback(&self, source: &str, sink: &str) -> u32 {
        let mut graph = self.graph();
        let module_id = graph.next_index();
        graph.loopbacks.push(LoopbackInfo {
            module_id,
            source: source.to_string(),
            sink: sink.to_string(),
            latency_ms: 5,
            sample_rate: 48000,
            role: None,
        });
        module_id
    }

    /// Create the microphone the way an earlier generation did: as a sink
    pub fn inject_legacy_microphone_sink(&self, name: &str) {
        let mut graph = self.graph();
        let module = graph.next_index();
        for (suffix, class) in [("", NodeClass::Sink), (".monitor", NodeClass::Monitor)] {
            let index = graph.next_index();
            graph.nodes.push(NodeInfo {
                index,
                name: format!("{}{}", name, suffix),
                class,
                channels: 2,
                sample_rate: 48000,
                owner_module: Some(module),
                active_port: None,
                properties: Default::default(),
            });
        }
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.graph().nodes.clone()
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        self.graph().streams.clone()
    }

    pub fn loopbacks(&self) -> Vec<LoopbackInfo> {
        self.graph().loopbacks.clone()
    }

    pub fn loopback_count(&self) -> usize {
        self.graph().loopbacks.len()
    }

    /// Virtual sinks and sources, monitors excluded
    pub fn virtual_device_count(&self) -> usize {
        self.graph()
            .nodes
            .iter()
            .filter(|n| n.is_virtual() && n.class != NodeClass::Monitor)
            .count()
    }

    pub fn has_node(&self, name: &str, class: NodeClass) -> bool {
        self.graph().has_node(name, class)
    }

    pub fn policy(&self) -> Option<PolicyDocument> {
        self.graph().policy.clone()
    }

    pub fn policy_writes(&self) -> usize {
        self.graph().policy_writes
    }

    pub fn device_creates(&self) -> usize {
        self.graph().device_creates
    }

    pub fn link_creates(&self) -> usize {
        self.graph().link_creates
    }
}

#[async_trait]
impl AudioServer for InMemoryAudioServer {
    async fn ping(&self) -> Result<()> {
        self.enter().await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.enter().await?;
        Ok(self.graph().nodes.clone())
    }

    async fn list_loopbacks(&self) -> Result<Vec<LoopbackInfo>> {
        self.enter().await?;
        Ok(self.graph().loopbacks.clone())
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>> {
        self.enter().await?;
        Ok(self.graph().streams.clone())
    }

    async fn create_virtual_device(&self, device: &VirtualDevice) -> Result<u32> {
        self.enter().await?;
        let mut graph = self.graph();
        graph.device_creates += 1;
        if graph.failing_devices.contains(&device.name) {
            return Err(AudioError::CommandFailed(format!(
                "load-module for {} refused",
                device.name
            )));
        }

        let module = graph.next_index();
        let media_class = match device.kind {
            DeviceKind::Sink => "Audio/Sink",
            DeviceKind::Source => "Audio/Source/Virtual",
        };
        let base = NodeInfo {
            index: graph.next_index(),
            name: device.name.clone(),
            class: device.kind.node_class(),
            channels: device.channels.count(),
            sample_rate: device.sample_rate.hz(),
            owner_module: Some(module),
            active_port: None,
            properties: [
                ("media.class".to_string(), media_class.to_string()),
                ("device.description".to_string(), device.description.clone()),
            ]
            .into_iter()
            .collect(),
        };
        if let Some(monitor) = device.monitor_source_name() {
            let index = graph.next_index();
            graph.nodes.push(NodeInfo {
                index,
                name: monitor,
                class: NodeClass::Monitor,
                ..base.clone()
            });
        }
        graph.nodes.push(base);
        Ok(module)
    }

    async fn remove_virtual_device(&self, name: &str, kind: DeviceKind) -> Result<()> {
        self.enter().await?;
        let mut graph = self.graph();
        let module = graph
            .nodes
            .iter()
            .find(|n| n.name == name && n.class == kind.node_class())
            .and_then(|n| n.owner_module)
            .ok_or_else(|| AudioError::DeviceNotFound(format!("{} {}", kind, name)))?;
        graph.drop_nodes_where(|n| n.owner_module == Some(module));
        Ok(())
    }

    async fn create_loopback(&self, link: &LoopbackLink) -> Result<u32> {
        self.enter().await?;
        let mut graph = self.graph();
        graph.link_creates += 1;
        if graph.failing_links.contains(&link.key()) {
            return Err(AudioError::CommandFailed(format!(
                "load-module module-loopback for {} refused",
                link.key()
            )));
        }
        let source_ok = graph.has_node(&link.source, NodeClass::Source)
            || graph.has_node(&link.source, NodeClass::Monitor);
        // A virtual source takes playback on its input ports
        let sink_ok = graph.has_node(&link.sink, NodeClass::Sink)
            || graph
                .nodes
                .iter()
                .any(|n| n.name == link.sink && n.class == NodeClass::Source && n.is_virtual());
        if !source_ok || !sink_ok {
            return Err(AudioError::CommandFailed(format!(
                "no such endpoint for {}",
                link.key()
            )));
        }

        let module_id = graph.next_index();
        graph.loopbacks.push(LoopbackInfo {
            module_id,
            source: link.source.clone(),
            sink: link.sink.clone(),
            latency_ms: link.options.latency_ms,
            sample_rate: link.options.sample_rate_hz,
            role: link.role,
        });
        for (direction, target) in [
            (StreamDirection::Capture, link.source.clone()),
            (StreamDirection::Playback, link.sink.clone()),
        ] {
            let index = graph.next_index();
            graph.streams.push(StreamInfo {
                index,
                direction,
                application: "PipeWire".to_string(),
                binary: None,
                target,
                owner_module: Some(module_id),
            });
        }
        Ok(module_id)
    }

    async fn destroy_loopback(&self, module_id: u32) -> Result<()> {
        self.enter().await?;
        let mut graph = self.graph();
        let before = graph.loopbacks.len();
        graph.loopbacks.retain(|l| l.module_id != module_id);
        if graph.loopbacks.len() == before {
            return Err(AudioError::CommandFailed(format!(
                "no loopback module {}",
                module_id
            )));
        }
        graph.streams.retain(|s| s.owner_module != Some(module_id));
        Ok(())
    }

    async fn move_stream(&self, stream: &StreamInfo, target: &str) -> Result<()> {
        self.enter().await?;
        let mut graph = self.graph();
        let class = stream.direction.device_kind().node_class();
        if !graph.has_node(target, class) {
            return Err(AudioError::DeviceNotFound(target.to_string()));
        }
        let found = graph
            .streams
            .iter_mut()
            .find(|s| s.index == stream.index)
            .ok_or_else(|| AudioError::CommandFailed(format!("no stream {}", stream.index)))?;
        found.target = target.to_string();
        Ok(())
    }

    async fn kill_stream(&self, stream: &StreamInfo) -> Result<()> {
        self.enter().await?;
        self.graph().streams.retain(|s| s.index != stream.index);
        Ok(())
    }

    async fn install_access_policy(&self, document: &PolicyDocument) -> Result<bool> {
        self.enter().await?;
        let mut graph = self.graph();
        if graph.policy.as_ref() == Some(document) {
            return Ok(false);
        }
        graph.policy = Some(document.clone());
        graph.policy_writes += 1;
        Ok(true)
    }

    async fn endpoint_state(&self, name: &str, kind: DeviceKind) -> Result<EndpointState> {
        self.enter().await?;
        let graph = self.graph();
        if !graph.has_node(name, kind.node_class()) {
            return Err(AudioError::DeviceNotFound(name.to_string()));
        }
        Ok(graph
            .endpoints
            .get(&(name.to_string(), kind))
            .copied()
            .unwrap_or_default())
    }

    async fn set_volume(&self, name: &str, kind: DeviceKind, volume: u8) -> Result<()> {
        self.enter().await?;
        let mut graph = self.graph();
        if !graph.has_node(name, kind.node_class()) {
            return Err(AudioError::DeviceNotFound(name.to_string()));
        }
        graph
            .endpoints
            .entry((name.to_string(), kind))
            .or_default()
            .volume = volume.min(100);
        Ok(())
    }

    async fn set_mute(&self, name: &str, kind: DeviceKind, muted: bool) -> Result<()> {
        self.enter().await?;
        let mut graph = self.graph();
        if !graph.has_node(name, kind.node_class()) {
            return Err(AudioError::DeviceNotFound(name.to_string()));
        }
        graph
            .endpoints
            .entry((name.to_string(), kind))
            .or_default()
            .muted = muted;
        Ok(())
    }

    async fn peak_level(&self, name: &str, _kind: DeviceKind) -> Result<f32> {
        self.enter().await?;
        Ok(self.graph().peaks.get(name).copied().unwrap_or(0.0))
    }
}
