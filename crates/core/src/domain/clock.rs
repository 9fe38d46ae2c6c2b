//! Network-audio clock domain
//!
//! The PTP daemon follows a grandmaster; [`ClockSyncBridge`] watches its
//! state, publishes the virtual-clock socket the network-audio PCM plugin
//! reads, and treats any sign of master role as a fatal misconfiguration.

use crate::domain::audio::AudioError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Where the PTP daemon's virtual clock is exported
pub const DEFAULT_CLOCK_SOCKET: &str = "/tmp/ptp-usrvclock";

/// Errors of the clock domain
#[derive(Debug, Error)]
pub enum ClockError {
    /// This device must never act as PTP master
    #[error("PTP master role observed: {0}")]
    MasterObserved(String),

    #[error("PTP role must be follower")]
    MasterConfigured,

    #[error("Clock socket {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid PCM stanza: {0}")]
    InvalidStanza(String),
}

pub type Result<T> = std::result::Result<T, ClockError>;

/// Configured PTP role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtpRole {
    #[default]
    Follower,
    Master,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampingMode {
    #[default]
    HardwareAssisted,
    SoftwareFallback,
}

impl fmt::Display for TimestampingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampingMode::HardwareAssisted => write!(f, "hardware"),
            TimestampingMode::SoftwareFallback => write!(f, "software"),
        }
    }
}

/// The clock the network-audio path depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockDomain {
    pub socket_path: PathBuf,
    #[serde(default)]
    pub role: PtpRole,
    /// Preferred mode; the daemon may fall back to software
    #[serde(default)]
    pub timestamping_mode: TimestampingMode,
}

impl Default for ClockDomain {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_CLOCK_SOCKET),
            role: PtpRole::Follower,
            timestamping_mode: TimestampingMode::HardwareAssisted,
        }
    }
}

impl ClockDomain {
    pub fn validate(&self) -> Result<()> {
        if self.role == PtpRole::Master {
            return Err(ClockError::MasterConfigured);
        }
        Ok(())
    }
}

/// Synchronisation state of the local PTP follower
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "timestamping", rename_all = "snake_case")]
pub enum ClockState {
    Unsynced,
    Negotiating,
    Follower(TimestampingMode),
}

impl ClockState {
    pub fn is_locked(&self) -> bool {
        matches!(self, ClockState::Follower(_))
    }
}

/// Something the PTP daemon reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpEvent {
    Listening,
    Uncalibrated,
    /// Locked to a grandmaster
    Slave,
    Master,
    Faulty,
    HardwareTimestamping,
    SoftwareTimestamping,
}

impl PtpEvent {
    /// Classify a PTP daemon log line
    ///
    /// `MASTER` only counts as a whole upper-case word in the state entered,
    /// so mentions of a grandmaster or leaving MASTER do not.
    pub fn from_log_line(line: &str) -> Option<Self> {
        let words = |text: &str| -> Vec<String> {
            text.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect()
        };
        // "UNCALIBRATED to SLAVE": the state after the transition counts
        let target = line.rsplit_once(" to ").map(|(_, t)| t).unwrap_or(line);
        let target = words(target);
        if target.iter().any(|w| w == "MASTER") {
            return Some(PtpEvent::Master);
        }

        let lower = line.to_ascii_lowercase();
        if lower.contains("software timestamp") || lower.contains("software_timestamp") {
            return Some(PtpEvent::SoftwareTimestamping);
        }
        if lower.contains("hardware timestamp") || lower.contains("hardware_timestamp") {
            return Some(PtpEvent::HardwareTimestamping);
        }

        let has = |state: &str| target.iter().any(|w| w.eq_ignore_ascii_case(state));
        if has("faulty") {
            Some(PtpEvent::Faulty)
        } else if has("slave") {
            Some(PtpEvent::Slave)
        } else if has("uncalibrated") {
            Some(PtpEvent::Uncalibrated)
        } else if has("listening") {
            Some(PtpEvent::Listening)
        } else {
            None
        }
    }
}

/// Follows the PTP daemon and owns the exported clock socket
pub struct ClockSyncBridge {
    domain: ClockDomain,
    state: ClockState,
    mode: TimestampingMode,
    socket: Option<UnixDatagram>,
}

impl ClockSyncBridge {
    pub fn new(domain: ClockDomain) -> Result<Self> {
        domain.validate()?;
        Ok(Self {
            mode: domain.timestamping_mode,
            domain,
            state: ClockState::Unsynced,
            socket: None,
        })
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn socket_path(&self) -> &Path {
        &self.domain.socket_path
    }

    /// Advance the state machine
    pub fn handle(&mut self, event: PtpEvent) -> Result<ClockState> {
        let next = match (event, self.state) {
            (PtpEvent::Master, _) => {
                return Err(ClockError::MasterObserved(format!(
                    "while {:?}",
                    self.state
                )))
            }
            (PtpEvent::Faulty, _) => ClockState::Unsynced,
            (PtpEvent::Listening | PtpEvent::Uncalibrated, _) => ClockState::Negotiating,
            (PtpEvent::HardwareTimestamping, state) => {
                self.mode = TimestampingMode::HardwareAssisted;
                state
            }
            (PtpEvent::SoftwareTimestamping, ClockState::Follower(_)) => {
                self.mode = TimestampingMode::SoftwareFallback;
                ClockState::Follower(self.mode)
            }
            (PtpEvent::SoftwareTimestamping, state) => {
                self.mode = TimestampingMode::SoftwareFallback;
                state
            }
            (PtpEvent::Slave, _) => ClockState::Follower(self.mode),
        };

        if next != self.state {
            info!(from = ?self.state, to = ?next, "Clock state changed");
        }
        self.state = next;

        if next.is_locked() && self.socket.is_none() {
            self.publish_socket()?;
        }
        Ok(next)
    }

    /// Feed a raw daemon log line
    pub fn handle_line(&mut self, line: &str) -> Result<Option<ClockState>> {
        match PtpEvent::from_log_line(line) {
            Some(event) => {
                debug!(?event, "PTP event");
                self.handle(event).map(Some)
            }
            None => Ok(None),
        }
    }

    fn publish_socket(&mut self) -> Result<()> {
        let path = self.domain.socket_path.clone();
        if path.exists() {
            warn!(path = %path.display(), "Removing stale clock socket");
            std::fs::remove_file(&path).map_err(|source| ClockError::Socket {
                path: path.clone(),
                source,
            })?;
        }
        let socket =
            UnixDatagram::bind(&path).map_err(|source| ClockError::Socket { path: path.clone(), source })?;
        info!(path = %path.display(), "Published clock socket");
        self.socket = Some(socket);
        Ok(())
    }
}

impl Drop for ClockSyncBridge {
    fn drop(&mut self) {
        if self.socket.take().is_some() {
            let _ = std::fs::remove_file(&self.domain.socket_path);
        }
    }
}

/// Hard precondition of the network-audio PCM device
pub fn check_clock_socket(path: &Path) -> std::result::Result<(), AudioError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => Ok(()),
        _ => Err(AudioError::ClockUnavailable {
            path: path.display().to_string(),
        }),
    }
}

/// The `/etc/asound.conf` block declaring the network-audio PCM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlsaPcmStanza {
    pub pcm_name: String,
    pub plugin_type: String,
    pub sample_rate: u32,
    pub rx_channels: u16,
    pub tx_channels: u16,
    pub clock_path: PathBuf,
    pub interface: String,
    pub device_name: String,
}

impl Default for AlsaPcmStanza {
    fn default() -> Self {
        Self {
            pcm_name: "dante".to_string(),
            plugin_type: "inferno".to_string(),
            sample_rate: 96000,
            rx_channels: 2,
            tx_channels: 2,
            clock_path: PathBuf::from(DEFAULT_CLOCK_SOCKET),
            interface: "br0".to_string(),
            device_name: "media-bridge".to_string(),
        }
    }
}

impl AlsaPcmStanza {
    /// Reject passthrough wrappers and anything off the fixed rate/channel contract
    pub fn validate(&self) -> Result<()> {
        if self.plugin_type == "plug" {
            return Err(ClockError::InvalidStanza(format!(
                "pcm.{} must not be a plug wrapper",
                self.pcm_name
            )));
        }
        if self.sample_rate != 96000 {
            return Err(ClockError::InvalidStanza(format!(
                "SAMPLE_RATE must be 96000, got {}",
                self.sample_rate
            )));
        }
        if self.rx_channels != 2 || self.tx_channels != 2 {
            return Err(ClockError::InvalidStanza(format!(
                "RX/TX_CHANNELS must be 2, got {}/{}",
                self.rx_channels, self.tx_channels
            )));
        }
        if self.interface.is_empty() || self.device_name.is_empty() {
            return Err(ClockError::InvalidStanza(
                "INTERFACE and DEVICE_NAME are required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        format!(
            "pcm.{} {{\n    type {}\n    SAMPLE_RATE {}\n    RX_CHANNELS {}\n    TX_CHANNELS {}\n    CLOCK_PATH \"{}\"\n    INTERFACE \"{}\"\n    DEVICE_NAME \"{}\"\n}}\n",
            self.pcm_name,
            self.plugin_type,
            self.sample_rate,
            self.rx_channels,
            self.tx_channels,
            self.clock_path.display(),
            self.interface,
            self.device_name,
        )
    }

    /// Find and parse `pcm.<name>` in an asound.conf
    pub fn parse(config: &str, pcm_name: &str) -> Result<Self> {
        let header = format!("pcm.{}", pcm_name);
        let start = config
            .lines()
            .position(|l| {
                let l = l.trim();
                l.starts_with(&header) && l[header.len()..].trim_start().starts_with('{')
            })
            .ok_or_else(|| ClockError::InvalidStanza(format!("{} not declared", header)))?;

        let mut stanza = AlsaPcmStanza {
            pcm_name: pcm_name.to_string(),
            plugin_type: String::new(),
            sample_rate: 0,
            rx_channels: 0,
            tx_channels: 0,
            clock_path: PathBuf::new(),
            interface: String::new(),
            device_name: String::new(),
        };

        for line in config.lines().skip(start + 1) {
            let line = line.trim();
            if line.starts_with('}') {
                return Ok(stanza);
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            let invalid = || ClockError::InvalidStanza(format!("{} is out of range: {}", key, value));
            match key.to_ascii_uppercase().as_str() {
                "TYPE" => stanza.plugin_type = value.to_string(),
                "SAMPLE_RATE" => stanza.sample_rate = value.parse::<u32>().map_err(|_| invalid())?,
                "RX_CHANNELS" => stanza.rx_channels = value.parse::<u16>().map_err(|_| invalid())?,
                "TX_CHANNELS" => stanza.tx_channels = value.parse::<u16>().map_err(|_| invalid())?,
                "CLOCK_PATH" => stanza.clock_path = PathBuf::from(value),
                "INTERFACE" => stanza.interface = value.to_string(),
                "DEVICE_NAME" => stanza.device_name = value.to_string(),
                _ => {}
            }
        }
        Err(ClockError::InvalidStanza(format!("{} is not closed", header)))
    }
}
