//! Volume and mute of the intercom endpoints
//!
//! Mutations go through the same audio-server primitives the reconciler
//! uses, restricted to the two intercom virtual devices.

use crate::domain::audio::{AudioError, DeviceKind, Result, VirtualDevice};
use crate::domain::graph::{with_timeout, AudioServer};
use crate::domain::status::Status;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Which side of the intercom path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// The microphone Chrome records from
    Input,
    /// The speaker Chrome renders into
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteAction {
    On,
    Off,
    Toggle,
}

impl FromStr for MuteAction {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Ok(MuteAction::On),
            "off" | "false" | "0" => Ok(MuteAction::Off),
            "toggle" => Ok(MuteAction::Toggle),
            other => Err(AudioError::InvalidConfiguration(format!(
                "mute action must be on, off or toggle, got {}",
                other
            ))),
        }
    }
}

pub struct VolumeControl {
    server: Arc<dyn AudioServer>,
    call_timeout: Duration,
    speaker: String,
    microphone: String,
}

impl VolumeControl {
    pub fn new(
        server: Arc<dyn AudioServer>,
        call_timeout: Duration,
        speaker: &VirtualDevice,
        microphone: &VirtualDevice,
    ) -> Self {
        Self {
            server,
            call_timeout,
            speaker: speaker.name.clone(),
            microphone: microphone.name.clone(),
        }
    }

    fn target(&self, endpoint: Endpoint) -> (&str, DeviceKind) {
        match endpoint {
            Endpoint::Input => (self.microphone.as_str(), DeviceKind::Source),
            Endpoint::Output => (self.speaker.as_str(), DeviceKind::Sink),
        }
    }

    /// Map a node name to an intercom endpoint, refusing anything else
    pub fn endpoint_for(&self, device: &str) -> Result<Endpoint> {
        if device == self.microphone {
            Ok(Endpoint::Input)
        } else if device == self.speaker {
            Ok(Endpoint::Output)
        } else {
            Err(AudioError::PolicyViolationDetected {
                application: "volume-control".to_string(),
                device: device.to_string(),
            })
        }
    }

    /// Set volume, clamped to 0-100; returns the applied value
    pub async fn set_volume(&self, endpoint: Endpoint, percent: i64) -> Result<u8> {
        let volume = percent.clamp(0, 100) as u8;
        let (name, kind) = self.target(endpoint);
        with_timeout(
            self.call_timeout,
            "set volume",
            self.server.set_volume(name, kind, volume),
        )
        .await?;
        info!(device = name, volume, "Volume set");
        Ok(volume)
    }

    /// Apply a mute action; returns the resulting mute state
    pub async fn set_mute(&self, endpoint: Endpoint, action: MuteAction) -> Result<bool> {
        let (name, kind) = self.target(endpoint);
        let muted = match action {
            MuteAction::On => true,
            MuteAction::Off => false,
            MuteAction::Toggle => {
                !with_timeout(
                    self.call_timeout,
                    "read mute",
                    self.server.endpoint_state(name, kind),
                )
                .await?
                .muted
            }
        };
        with_timeout(
            self.call_timeout,
            "set mute",
            self.server.set_mute(name, kind, muted),
        )
        .await?;
        info!(device = name, muted, "Mute set");
        Ok(muted)
    }

    /// Re-apply a saved status
    pub async fn restore(&self, status: &Status) -> Result<()> {
        for (endpoint, state) in [(Endpoint::Input, status.input), (Endpoint::Output, status.output)] {
            self.set_volume(endpoint, i64::from(state.volume)).await?;
            let action = if state.muted { MuteAction::On } else { MuteAction::Off };
            self.set_mute(endpoint, action).await?;
        }
        Ok(())
    }
}
