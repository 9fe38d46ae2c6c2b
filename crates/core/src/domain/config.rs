//! Configuration management for the audio manager
//!
//! This module provides:
//! - The TOML configuration file and its sections
//! - Validation of the fixed audio contracts (latency, rates, PTP role, PCM stanza)
//! - A manager that falls back to factory defaults on missing or corrupt files
//! - Hot-reload support via file system watcher

use crate::domain::audio::{HardwareBinding, HardwareIdentity, HardwareRole, VirtualDevice};
use crate::domain::clock::{AlsaPcmStanza, ClockDomain, PtpRole, TimestampingMode, DEFAULT_CLOCK_SOCKET};
use crate::domain::policy::{validate_rules, AccessRule};
use crate::domain::reconciler::ReconcilerSettings;
use crate::domain::router::LinkOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/media-bridge/audio.toml";

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Process-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Deadline of each audio-server call
    pub call_timeout_ms: u64,

    /// Repeated reconciles within this window are coalesced
    pub debounce_ms: u64,

    /// Periodic resync in daemon mode
    pub resync_interval_secs: u64,

    /// Level meter sampling rate
    pub meter_rate_hz: u32,

    /// Metering decay rate in dB per second
    pub meter_decay_rate: f32,

    /// Cross-process reconcile lock
    pub lock_file: PathBuf,

    /// Where the rendered access policy is installed
    pub policy_file: PathBuf,

    /// Runtime desired state (self-monitoring)
    pub state_file: PathBuf,

    /// Saved volume/mute defaults
    pub defaults_file: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            debounce_ms: 1000,
            resync_interval_secs: 30,
            meter_rate_hz: 10,
            meter_decay_rate: 12.0,
            lock_file: PathBuf::from("/run/media-bridge/audio-manager.lock"),
            policy_file: PathBuf::from(
                "/etc/wireplumber/wireplumber.conf.d/60-media-bridge-access.conf",
            ),
            state_file: PathBuf::from("/var/lib/media-bridge/audio-state.json"),
            defaults_file: PathBuf::from("/etc/media-bridge/intercom.json"),
        }
    }
}

impl AppConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

/// The intercom virtual devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntercomConfig {
    pub speaker: VirtualDevice,
    pub microphone: VirtualDevice,
}

impl Default for IntercomConfig {
    fn default() -> Self {
        Self {
            speaker: VirtualDevice::intercom_speaker(),
            microphone: VirtualDevice::intercom_microphone(),
        }
    }
}

/// Stable identities of the appliance's hardware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Any of these is the intercom headset
    pub headset: Vec<HardwareIdentity>,
    /// HDMI outputs; the index is the output number
    pub hdmi: Vec<HardwareIdentity>,
    #[serde(default)]
    pub dante: Option<HardwareIdentity>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            headset: vec![HardwareIdentity::usb("0573", "1573")],
            hdmi: vec![
                HardwareIdentity::Port {
                    port: "hdmi-output-0".to_string(),
                },
                HardwareIdentity::Port {
                    port: "hdmi-output-1".to_string(),
                },
            ],
            dante: None,
        }
    }
}

impl HardwareConfig {
    pub fn bindings(&self) -> Vec<HardwareBinding> {
        let headsets = self.headset.iter().map(|identity| HardwareBinding {
            role: HardwareRole::IntercomHeadset,
            identity: identity.clone(),
        });
        let hdmi = self.hdmi.iter().enumerate().map(|(n, identity)| HardwareBinding {
            role: HardwareRole::HdmiOutput(n as u8),
            identity: identity.clone(),
        });
        let dante = self.dante.iter().map(|identity| HardwareBinding {
            role: HardwareRole::DanteEndpoint,
            identity: identity.clone(),
        });
        headsets.chain(hdmi).chain(dante).collect()
    }
}

/// Access rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// HDMI output assigned to the display renderer
    pub display_hdmi_output: u8,
    /// Install the intercom and display rules
    pub builtin_rules: bool,
    pub rules: Vec<AccessRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            display_hdmi_output: 0,
            builtin_rules: true,
            rules: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Built-in rules followed by configured ones
    pub fn effective_rules(&self) -> Vec<AccessRule> {
        let mut rules = if self.builtin_rules {
            AccessRule::builtin(self.display_hdmi_output)
        } else {
            Vec::new()
        };
        rules.extend(self.rules.iter().cloned());
        rules
    }
}

/// PTP follower and network-audio PCM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub socket_path: PathBuf,
    pub role: PtpRole,
    pub timestamping_mode: TimestampingMode,
    /// systemd unit of the PTP daemon
    pub ptp_unit: String,
    pub asound_conf: PathBuf,
    pub pcm: AlsaPcmStanza,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_CLOCK_SOCKET),
            role: PtpRole::Follower,
            timestamping_mode: TimestampingMode::HardwareAssisted,
            ptp_unit: "statime".to_string(),
            asound_conf: PathBuf::from("/etc/asound.conf"),
            pcm: AlsaPcmStanza::default(),
        }
    }
}

impl ClockConfig {
    pub fn domain(&self) -> ClockDomain {
        ClockDomain {
            socket_path: self.socket_path.clone(),
            role: self.role,
            timestamping_mode: self.timestamping_mode,
        }
    }
}

/// Complete audio manager configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeAudioConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub intercom: IntercomConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub loopback: LinkOptions,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub clock: ClockConfig,
}

impl BridgeAudioConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Create factory default configuration
    pub fn factory_default() -> Self {
        Self::default()
    }

    /// Reject configurations that break the fixed audio contracts
    pub fn validate(&self) -> Result<()> {
        let invalid = |e: &dyn std::fmt::Display| ConfigError::Invalid(e.to_string());

        self.loopback.validate().map_err(|e| invalid(&e))?;
        self.intercom.speaker.validate().map_err(|e| invalid(&e))?;
        self.intercom.microphone.validate().map_err(|e| invalid(&e))?;
        if self.intercom.speaker.name == self.intercom.microphone.name {
            return Err(ConfigError::Invalid(
                "speaker and microphone need distinct names".to_string(),
            ));
        }
        validate_rules(&self.policy.effective_rules()).map_err(|e| invalid(&e))?;
        if usize::from(self.policy.display_hdmi_output) >= self.hardware.hdmi.len()
            && self.policy.builtin_rules
        {
            return Err(ConfigError::Invalid(format!(
                "display renderer assigned to HDMI output {} but only {} configured",
                self.policy.display_hdmi_output,
                self.hardware.hdmi.len()
            )));
        }

        self.clock.domain().validate().map_err(|e| invalid(&e))?;
        self.clock.pcm.validate().map_err(|e| invalid(&e))?;
        if self.clock.pcm.clock_path != self.clock.socket_path {
            return Err(ConfigError::Invalid(format!(
                "PCM CLOCK_PATH {} differs from clock socket {}",
                self.clock.pcm.clock_path.display(),
                self.clock.socket_path.display()
            )));
        }
        if self.app.call_timeout_ms == 0 || self.app.meter_rate_hz == 0 {
            return Err(ConfigError::Invalid(
                "call timeout and meter rate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Reconciler tunables derived from this configuration
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            call_timeout: self.app.call_timeout(),
            debounce: self.app.debounce(),
            link: self.loopback,
            speaker: self.intercom.speaker.clone(),
            microphone: self.intercom.microphone.clone(),
            hardware: self.hardware.bindings(),
        }
    }
}

/// File system watcher for hot-reload of the config file
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
    config_tx: broadcast::Sender<PathBuf>,
}

impl ConfigWatcher {
    /// Watch a single configuration file
    pub async fn new(config_path: PathBuf) -> Result<Self> {
        use notify::Watcher;

        let (config_tx, _config_rx) = broadcast::channel(32);
        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ConfigError::Invalid("config path has no parent".to_string()))?;
        fs::create_dir_all(&dir).await?;

        let tx_clone = config_tx.clone();
        let file_name = config_path.file_name().map(|n| n.to_os_string());
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) {
                    for path in event.paths {
                        if path.file_name().map(|n| n.to_os_string()) == file_name {
                            if let Err(e) = tx_clone.send(path) {
                                error!("Failed to send config change event: {}", e);
                            }
                        }
                    }
                }
            }
        })?;

        // The directory, so that editors replacing the file are seen
        watcher.watch(&dir, notify::RecursiveMode::NonRecursive)?;

        info!(
            path = %config_path.display(),
            "Config watcher started"
        );

        Ok(Self {
            _watcher: watcher,
            config_tx,
        })
    }

    /// Subscribe to config change events
    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.config_tx.subscribe()
    }
}

/// Loads and saves the configuration file
///
/// Uses `/etc/media-bridge/audio.toml` when present, otherwise a per-user
/// file under the config directory.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Pick the configuration file: explicit, system, then per-user
    pub fn locate(explicit: Option<PathBuf>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system.exists() {
            return Self::new(system);
        }
        match dirs::config_dir() {
            Some(dir) => Self::new(dir.join("media-bridge").join("audio.toml")),
            None => Self::new(system),
        }
    }

    /// Get the config file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, returns factory default.
    /// If the config file is corrupt, logs an error and returns factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> BridgeAudioConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = BridgeAudioConfig::factory_default();

            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }

            return config;
        }

        match BridgeAudioConfig::load_from_file(&self.config_path).await {
            Ok(config) => {
                info!(
                    path = %self.config_path.display(),
                    "Configuration loaded successfully"
                );
                config
            }
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                BridgeAudioConfig::factory_default()
            }
        }
    }

    /// Load and validate
    pub async fn load_validated(&self) -> Result<BridgeAudioConfig> {
        let config = self.load().await;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &BridgeAudioConfig) -> Result<()> {
        config.save_to_file(&self.config_path).await
    }

    /// Check if config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
