//! Audio device abstractions and domain models
//!
//! This module defines the platform-agnostic vocabulary of the audio manager:
//! virtual devices owned by the registry, hardware devices identified by a
//! stable identity, and the error taxonomy shared by every component.
//! Implementations that talk to a real audio server live in the `infra` crate.

use crate::domain::graph::{LinkKey, NodeClass, NodeInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Canonical name of the intercom playback device
pub const INTERCOM_SPEAKER: &str = "intercom-speaker";

/// Canonical name of the intercom capture device
pub const INTERCOM_MICROPHONE: &str = "intercom-microphone";

/// Client name carried by the level meter's own capture streams
pub const METER_CLIENT: &str = "media-bridge-meter";

/// Errors that can occur in the audio subsystem
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AudioError {
    /// The audio server cannot be reached; nothing was mutated
    #[error("Audio server unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// A virtual device could not be created
    #[error("Failed to create device {name}: {reason}")]
    DeviceCreateFailed { name: String, reason: String },

    /// A loopback link could not be created
    #[error("Failed to create loopback {link}: {reason}")]
    LinkCreateFailed { link: LinkKey, reason: String },

    /// The network-audio clock socket is missing
    #[error("Clock socket unavailable: {path}")]
    ClockUnavailable { path: String },

    /// An application is connected to a device outside its access rule
    #[error("Policy violation: {application} connected to {device}")]
    PolicyViolationDetected { application: String, device: String },

    /// A call to the audio server exceeded its deadline
    #[error("Timed out after {millis} ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Invalid configuration for a device, link or rule
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The audio server rejected a command
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Output from the audio server could not be understood
    #[error("Parse error: {0}")]
    Parse(String),
}

impl AudioError {
    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        AudioError::BackendUnavailable {
            reason: reason.into(),
        }
    }

    /// Whether the error aborts a whole reconciliation
    pub fn is_fatal(&self) -> bool {
        matches!(self, AudioError::BackendUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Audio sample rate in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum SampleRate {
    Hz44100,
    Hz48000,
    Hz96000,
    Custom(u32),
}

impl SampleRate {
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz96000 => 96000,
            SampleRate::Custom(hz) => *hz,
        }
    }

    pub fn from_hz(hz: u32) -> Self {
        match hz {
            44100 => SampleRate::Hz44100,
            48000 => SampleRate::Hz48000,
            96000 => SampleRate::Hz96000,
            hz => SampleRate::Custom(hz),
        }
    }
}

impl From<u32> for SampleRate {
    fn from(hz: u32) -> Self {
        SampleRate::from_hz(hz)
    }
}

impl From<SampleRate> for u32 {
    fn from(rate: SampleRate) -> Self {
        rate.hz()
    }
}

/// Number of audio channels of a virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ChannelCount {
    Mono,
    Stereo,
}

impl ChannelCount {
    pub fn count(&self) -> u16 {
        match self {
            ChannelCount::Mono => 1,
            ChannelCount::Stereo => 2,
        }
    }
}

impl TryFrom<u16> for ChannelCount {
    type Error = AudioError;

    fn try_from(count: u16) -> Result<Self> {
        match count {
            1 => Ok(ChannelCount::Mono),
            2 => Ok(ChannelCount::Stereo),
            n => Err(AudioError::InvalidConfiguration(format!(
                "virtual devices carry 1 or 2 channels, got {}",
                n
            ))),
        }
    }
}

impl From<ChannelCount> for u16 {
    fn from(channels: ChannelCount) -> Self {
        channels.count()
    }
}

/// Whether a device renders audio (sink) or captures it (source)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Sink,
    Source,
}

impl DeviceKind {
    pub fn node_class(self) -> NodeClass {
        match self {
            DeviceKind::Sink => NodeClass::Sink,
            DeviceKind::Source => NodeClass::Source,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Sink => write!(f, "sink"),
            DeviceKind::Source => write!(f, "source"),
        }
    }
}

/// A software-defined sink or source with no direct hardware backing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub name: String,
    pub kind: DeviceKind,
    pub channels: ChannelCount,
    pub sample_rate: SampleRate,
    #[serde(default)]
    pub description: String,
}

impl VirtualDevice {
    pub fn new(name: impl Into<String>, kind: DeviceKind, channels: ChannelCount) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            kind,
            channels,
            sample_rate: SampleRate::Hz48000,
        }
    }

    /// Stereo sink Chrome renders into
    pub fn intercom_speaker() -> Self {
        let mut device = Self::new(INTERCOM_SPEAKER, DeviceKind::Sink, ChannelCount::Stereo);
        device.description = "Intercom Speaker".to_string();
        device
    }

    /// Mono capture-class source Chrome records from
    pub fn intercom_microphone() -> Self {
        let mut device = Self::new(INTERCOM_MICROPHONE, DeviceKind::Source, ChannelCount::Mono);
        device.description = "Intercom Microphone".to_string();
        device
    }

    /// Monitor source mirroring what is rendered to this device (sinks only)
    pub fn monitor_source_name(&self) -> Option<String> {
        match self.kind {
            DeviceKind::Sink => Some(format!("{}.monitor", self.name)),
            DeviceKind::Source => None,
        }
    }

    /// Check name, channel count and intercom sample rate
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(AudioError::InvalidConfiguration(format!(
                "invalid virtual device name {:?}",
                self.name
            )));
        }
        if self.name.starts_with("intercom-") && self.sample_rate != SampleRate::Hz48000 {
            return Err(AudioError::InvalidConfiguration(format!(
                "{} must run at 48000 Hz, got {}",
                self.name,
                self.sample_rate.hz()
            )));
        }
        Ok(())
    }
}

/// Stable identity of a hardware device
///
/// Never an OS-assigned card index: USB re-enumeration after a replug must
/// resolve to the same role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum HardwareIdentity {
    /// USB vendor/product id pair, hex without prefix (e.g. `0573`/`1573`)
    Usb { vendor_id: String, product_id: String },
    /// Substring of the node name (e.g. `CSCTEK_USB_Audio_and_HID`)
    NodeName { pattern: String },
    /// Card port or profile name (e.g. `hdmi-output-1`, `hdmi-stereo-extra1`)
    Port { port: String },
}

fn normalize_usb_id(id: &str) -> String {
    id.trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .to_ascii_lowercase()
}

impl HardwareIdentity {
    pub fn usb(vendor_id: &str, product_id: &str) -> Self {
        HardwareIdentity::Usb {
            vendor_id: normalize_usb_id(vendor_id),
            product_id: normalize_usb_id(product_id),
        }
    }

    /// Whether a live audio-server node belongs to this identity
    pub fn matches(&self, node: &NodeInfo) -> bool {
        match self {
            HardwareIdentity::Usb {
                vendor_id,
                product_id,
            } => {
                let vendor = node.property("device.vendor.id").map(normalize_usb_id);
                let product = node.property("device.product.id").map(normalize_usb_id);
                vendor.as_deref() == Some(normalize_usb_id(vendor_id).as_str())
                    && product.as_deref() == Some(normalize_usb_id(product_id).as_str())
            }
            HardwareIdentity::NodeName { pattern } => node.name.contains(pattern.as_str()),
            HardwareIdentity::Port { port } => {
                node.active_port.as_deref() == Some(port.as_str())
                    || node.property("device.profile.name") == Some(port.as_str())
            }
        }
    }
}

impl fmt::Display for HardwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareIdentity::Usb {
                vendor_id,
                product_id,
            } => write!(f, "usb:{}:{}", vendor_id, product_id),
            HardwareIdentity::NodeName { pattern } => write!(f, "name:{}", pattern),
            HardwareIdentity::Port { port } => write!(f, "port:{}", port),
        }
    }
}

/// Role a hardware device plays on the appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareRole {
    IntercomHeadset,
    HdmiOutput(u8),
    DanteEndpoint,
}

impl fmt::Display for HardwareRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareRole::IntercomHeadset => write!(f, "intercom-headset"),
            HardwareRole::HdmiOutput(port) => write!(f, "hdmi-output-{}", port),
            HardwareRole::DanteEndpoint => write!(f, "dante-endpoint"),
        }
    }
}

/// A configured hardware identity and the role it plays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareBinding {
    pub role: HardwareRole,
    pub identity: HardwareIdentity,
}

impl HardwareBinding {
    pub fn resolve(&self, nodes: &[NodeInfo]) -> HardwareDevice {
        HardwareDevice::resolve(&self.identity, self.role, nodes)
    }
}

/// A hardware device resolved against the live graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareDevice {
    pub identity: HardwareIdentity,
    pub role: HardwareRole,
    pub present: bool,
    /// Playback node name, when the device renders audio
    pub output: Option<String>,
    /// Capture node name, when the device records audio
    pub input: Option<String>,
}

impl HardwareDevice {
    /// Resolve an identity against the current node list
    ///
    /// Monitor sources are never taken as a hardware input.
    pub fn resolve(identity: &HardwareIdentity, role: HardwareRole, nodes: &[NodeInfo]) -> Self {
        let mut output = None;
        let mut input = None;

        for node in nodes.iter().filter(|n| !n.is_virtual() && identity.matches(n)) {
            match node.class {
                NodeClass::Sink if output.is_none() => output = Some(node.name.clone()),
                NodeClass::Source if input.is_none() => input = Some(node.name.clone()),
                _ => {}
            }
        }

        Self {
            identity: identity.clone(),
            role,
            present: output.is_some() || input.is_some(),
            output,
            input,
        }
    }

    /// Node names owned by this device
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.output.iter().chain(self.input.iter()).map(String::as_str)
    }
}
