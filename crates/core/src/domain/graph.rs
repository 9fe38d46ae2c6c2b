//! Live audio-server graph and the backend trait
//!
//! The audio server's device/link graph is the one shared mutable resource of
//! the appliance. Components never cache it: every reconciliation reads a
//! fresh [`GraphSnapshot`] through [`AudioServer`], diffs it against desired
//! state and applies the delta through the same trait.

use crate::domain::audio::{AudioError, DeviceKind, Result, VirtualDevice};
use crate::domain::policy::PolicyDocument;
use crate::domain::router::{LinkRole, LoopbackLink};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Class of a node in the audio-server graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeClass {
    Sink,
    Source,
    /// Capture endpoint mirroring a sink
    Monitor,
}

/// A sink or source as reported by the audio server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub index: u32,
    pub name: String,
    pub class: NodeClass,
    pub channels: u16,
    pub sample_rate: u32,
    /// Module that created the node, `None` for hardware nodes
    pub owner_module: Option<u32>,
    pub active_port: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl NodeInfo {
    /// A hardware-backed node with default parameters
    pub fn hardware(name: impl Into<String>, class: NodeClass) -> Self {
        Self {
            index: 0,
            name: name.into(),
            class,
            channels: 2,
            sample_rate: 48000,
            owner_module: None,
            active_port: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_port(mut self, port: &str) -> Self {
        self.active_port = Some(port.to_string());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Whether the node is software-defined (null sink, virtual source)
    pub fn is_virtual(&self) -> bool {
        if let Some(class) = self.property("media.class") {
            if class.contains("Virtual") {
                return true;
            }
        }
        self.owner_module.is_some() && self.property("device.api").is_none()
    }

    pub fn is_hdmi(&self) -> bool {
        self.class == NodeClass::Sink
            && (self.name.to_ascii_lowercase().contains("hdmi")
                || self
                    .active_port
                    .as_deref()
                    .map(|p| p.contains("hdmi"))
                    .unwrap_or(false))
    }

    /// The device kind this node can stand in for, monitors excluded
    pub fn kind(&self) -> Option<DeviceKind> {
        match self.class {
            NodeClass::Sink => Some(DeviceKind::Sink),
            NodeClass::Source => Some(DeviceKind::Source),
            NodeClass::Monitor => None,
        }
    }
}

/// Semantic identity of a loopback: the ordered (source, sink) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkKey {
    pub source: String,
    pub sink: String,
}

impl LinkKey {
    pub fn new(source: impl Into<String>, sink: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sink: sink.into(),
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.sink)
    }
}

/// A loopback module as reported by the audio server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackInfo {
    pub module_id: u32,
    pub source: String,
    pub sink: String,
    pub latency_ms: u32,
    pub sample_rate: u32,
    /// Role tag written by the router when it created the link
    pub role: Option<LinkRole>,
}

impl LoopbackInfo {
    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.source.clone(), self.sink.clone())
    }
}

/// Direction of a client stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    /// Application renders into a sink
    Playback,
    /// Application records from a source
    Capture,
}

impl StreamDirection {
    pub fn device_kind(self) -> DeviceKind {
        match self {
            StreamDirection::Playback => DeviceKind::Sink,
            StreamDirection::Capture => DeviceKind::Source,
        }
    }
}

/// An active application stream attached to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    pub direction: StreamDirection,
    pub application: String,
    pub binary: Option<String>,
    /// Name of the node the stream is attached to
    pub target: String,
    /// Set when the stream belongs to a module (loopbacks), not a client
    pub owner_module: Option<u32>,
}

impl StreamInfo {
    pub fn is_client(&self) -> bool {
        self.owner_module.is_none()
    }
}

/// Volume and mute of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointState {
    /// Percent, 0-100
    pub volume: u8,
    pub muted: bool,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            volume: 100,
            muted: false,
        }
    }
}

/// Everything the reconciler needs from one enumeration pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeInfo>,
    pub loopbacks: Vec<LoopbackInfo>,
}

impl GraphSnapshot {
    pub fn node(&self, name: &str, class: NodeClass) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.name == name && n.class == class)
    }

    pub fn hdmi_sinks(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.is_hdmi())
            .map(|n| n.name.clone())
            .collect()
    }
}

/// Blocking operations against the audio server
///
/// Every method is a suspension point; callers bound them with
/// [`with_timeout`]. Implementations must not cache graph state.
#[async_trait]
pub trait AudioServer: Send + Sync {
    /// Check that the server answers at all
    async fn ping(&self) -> Result<()>;

    /// All sinks, sources and monitor sources
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// All loopback modules
    async fn list_loopbacks(&self) -> Result<Vec<LoopbackInfo>>;

    /// All playback and capture streams
    async fn list_streams(&self) -> Result<Vec<StreamInfo>>;

    /// Create a virtual device, returning its module id
    async fn create_virtual_device(&self, device: &VirtualDevice) -> Result<u32>;

    /// Remove the virtual device with this name and kind
    async fn remove_virtual_device(&self, name: &str, kind: DeviceKind) -> Result<()>;

    /// Create a loopback module, returning its module id
    async fn create_loopback(&self, link: &LoopbackLink) -> Result<u32>;

    async fn destroy_loopback(&self, module_id: u32) -> Result<()>;

    /// Re-attach a client stream to another node
    async fn move_stream(&self, stream: &StreamInfo, target: &str) -> Result<()>;

    /// Disconnect a client stream
    async fn kill_stream(&self, stream: &StreamInfo) -> Result<()>;

    /// Install the rendered access policy; returns whether anything changed
    async fn install_access_policy(&self, document: &PolicyDocument) -> Result<bool>;

    async fn endpoint_state(&self, name: &str, kind: DeviceKind) -> Result<EndpointState>;

    async fn set_volume(&self, name: &str, kind: DeviceKind, volume: u8) -> Result<()>;

    async fn set_mute(&self, name: &str, kind: DeviceKind, muted: bool) -> Result<()>;

    /// Sample peak of the endpoint, 0.0 to 1.0
    async fn peak_level(&self, name: &str, kind: DeviceKind) -> Result<f32>;
}

/// Bound a backend call by a deadline
pub async fn with_timeout<T, F>(deadline: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(AudioError::Timeout {
            operation: operation.to_string(),
            millis: deadline.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_detection() {
        let hw = NodeInfo::hardware("alsa_output.pci-0000_00_1f.3.hdmi-stereo", NodeClass::Sink)
            .with_property("device.api", "alsa");
        assert!(!hw.is_virtual());
        assert!(hw.is_hdmi());

        let mut null_sink = NodeInfo::hardware("intercom-speaker", NodeClass::Sink);
        null_sink.owner_module = Some(17);
        assert!(null_sink.is_virtual());

        let source = NodeInfo::hardware("intercom-microphone", NodeClass::Source)
            .with_property("media.class", "Audio/Source/Virtual");
        assert!(source.is_virtual());
    }

    #[test]
    fn test_link_key_display() {
        let key = LinkKey::new("intercom-speaker.monitor", "alsa_output.usb");
        assert_eq!(key.to_string(), "intercom-speaker.monitor -> alsa_output.usb");
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), "list nodes", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert_eq!(
            result,
            Err(AudioError::Timeout {
                operation: "list nodes".to_string(),
                millis: 10
            })
        );
    }
}
