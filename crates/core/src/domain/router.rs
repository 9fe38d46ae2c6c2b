//! Loopback routing between virtual devices and hardware
//!
//! The router is the only writer of routing state. Links are matched by
//! their semantic (source, sink) pair, never by module id, so repeating
//! setup against an already-linked headset is a no-op.
//!
//! Topology is fixed per role:
//! - `intercom-speaker.monitor -> <headset output>` (playback)
//! - `<headset input> -> intercom-microphone` (capture)
//! - optionally `<headset input> -> <headset output>` (self-monitoring)

use crate::domain::audio::{AudioError, HardwareDevice, Result, VirtualDevice};
use crate::domain::graph::{with_timeout, AudioServer, LinkKey, LoopbackInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Upper bound on loopback latency
pub const MAX_LATENCY_MS: u32 = 10;

/// Lower bound on loopback sample rate
pub const MIN_LINK_RATE_HZ: u32 = 48000;

/// Parameters of a loopback link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOptions {
    pub latency_ms: u32,
    pub sample_rate_hz: u32,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            latency_ms: 5,
            sample_rate_hz: 48000,
        }
    }
}

impl LinkOptions {
    pub fn validate(&self) -> Result<()> {
        if self.latency_ms == 0 || self.latency_ms > MAX_LATENCY_MS {
            return Err(AudioError::InvalidConfiguration(format!(
                "loopback latency must be 1-{} ms, got {}",
                MAX_LATENCY_MS, self.latency_ms
            )));
        }
        if self.sample_rate_hz < MIN_LINK_RATE_HZ {
            return Err(AudioError::InvalidConfiguration(format!(
                "loopback rate must be at least {} Hz, got {}",
                MIN_LINK_RATE_HZ, self.sample_rate_hz
            )));
        }
        Ok(())
    }
}

/// What a link is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    /// Chrome's rendered audio to the earpiece
    Playback,
    /// The physical microphone to Chrome's capture
    Capture,
    /// Headset microphone straight to the earpiece
    Monitor,
}

impl LinkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkRole::Playback => "playback",
            LinkRole::Capture => "capture",
            LinkRole::Monitor => "monitor",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "playback" => Some(LinkRole::Playback),
            "capture" => Some(LinkRole::Capture),
            "monitor" => Some(LinkRole::Monitor),
            _ => None,
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A desired loopback link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackLink {
    pub source: String,
    pub sink: String,
    /// Tag stored with the module so later runs can recognise the link
    pub role: Option<LinkRole>,
    pub options: LinkOptions,
}

impl LoopbackLink {
    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.source.clone(), self.sink.clone())
    }
}

/// Result of ensuring a single link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created(u32),
    Existing(u32),
}

/// Creates and tears down loopback links
pub struct LoopbackRouter {
    server: Arc<dyn AudioServer>,
    call_timeout: Duration,
    defaults: LinkOptions,
}

impl LoopbackRouter {
    pub fn new(server: Arc<dyn AudioServer>, call_timeout: Duration, defaults: LinkOptions) -> Self {
        Self {
            server,
            call_timeout,
            defaults,
        }
    }

    pub fn defaults(&self) -> LinkOptions {
        self.defaults
    }

    /// The two links a present headset requires, playback first
    ///
    /// Returns an error when the headset lacks one of its endpoints, since
    /// both directions must exist together or neither.
    pub fn headset_links(
        &self,
        headset: &HardwareDevice,
        speaker: &VirtualDevice,
        microphone: &VirtualDevice,
    ) -> Result<[LoopbackLink; 2]> {
        let (output, input) = match (&headset.output, &headset.input) {
            (Some(output), Some(input)) => (output, input),
            _ => {
                return Err(AudioError::DeviceNotFound(format!(
                    "headset {} is missing its {} endpoint",
                    headset.identity,
                    if headset.output.is_none() { "output" } else { "input" }
                )))
            }
        };
        let speaker_monitor = speaker.monitor_source_name().ok_or_else(|| {
            AudioError::InvalidConfiguration(format!("{} is not a sink", speaker.name))
        })?;

        Ok([
            LoopbackLink {
                source: speaker_monitor,
                sink: output.clone(),
                role: Some(LinkRole::Playback),
                options: self.defaults,
            },
            LoopbackLink {
                source: input.clone(),
                sink: microphone.name.clone(),
                role: Some(LinkRole::Capture),
                options: self.defaults,
            },
        ])
    }

    /// Self-monitoring link for a present headset
    pub fn monitor_link(&self, headset: &HardwareDevice) -> Option<LoopbackLink> {
        Some(LoopbackLink {
            source: headset.input.clone()?,
            sink: headset.output.clone()?,
            role: Some(LinkRole::Monitor),
            options: self.defaults,
        })
    }

    /// Role of an existing loopback, if it belongs to the router
    pub fn classify(
        &self,
        link: &LoopbackInfo,
        speaker: &VirtualDevice,
        microphone: &VirtualDevice,
    ) -> Option<LinkRole> {
        if link.role.is_some() {
            return link.role;
        }
        // Links made before role tags existed
        if speaker.monitor_source_name().as_deref() == Some(link.source.as_str()) {
            Some(LinkRole::Playback)
        } else if link.sink == microphone.name {
            Some(LinkRole::Capture)
        } else {
            None
        }
    }

    /// Ensure a link between two named endpoints exists
    #[instrument(skip(self, opts))]
    pub async fn ensure_link(&self, source: &str, sink: &str, opts: LinkOptions) -> Result<bool> {
        let existing = with_timeout(
            self.call_timeout,
            "list loopbacks",
            self.server.list_loopbacks(),
        )
        .await?;

        let link = LoopbackLink {
            source: source.to_string(),
            sink: sink.to_string(),
            role: None,
            options: opts,
        };
        let outcome = self.ensure_link_in(&link, &existing).await?;
        Ok(matches!(outcome, LinkOutcome::Existing(_)))
    }

    /// Ensure a link exists, given an already enumerated link list
    pub async fn ensure_link_in(
        &self,
        link: &LoopbackLink,
        existing: &[LoopbackInfo],
    ) -> Result<LinkOutcome> {
        let key = link.key();
        if let Some(found) = existing.iter().find(|l| l.key() == key) {
            if found.latency_ms > MAX_LATENCY_MS || found.sample_rate < MIN_LINK_RATE_HZ {
                warn!(
                    link = %key,
                    latency_ms = found.latency_ms,
                    rate = found.sample_rate,
                    "Existing loopback is outside latency/rate bounds"
                );
            }
            debug!(link = %key, module = found.module_id, "Loopback already present");
            return Ok(LinkOutcome::Existing(found.module_id));
        }

        link.options.validate()?;
        let module_id = with_timeout(
            self.call_timeout,
            "create loopback",
            self.server.create_loopback(link),
        )
        .await
        .map_err(|e| AudioError::LinkCreateFailed {
            link: key.clone(),
            reason: e.to_string(),
        })?;

        info!(
            link = %key,
            role = ?link.role,
            module = module_id,
            latency_ms = link.options.latency_ms,
            "Created loopback"
        );
        Ok(LinkOutcome::Created(module_id))
    }

    /// Tear down an existing link
    pub async fn remove_link(&self, link: &LoopbackInfo) -> Result<()> {
        with_timeout(
            self.call_timeout,
            "destroy loopback",
            self.server.destroy_loopback(link.module_id),
        )
        .await?;
        info!(link = %link.key(), module = link.module_id, "Removed loopback");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::{HardwareIdentity, HardwareRole};
    use crate::domain::memory::InMemoryAudioServer;

    fn router(server: Arc<InMemoryAudioServer>) -> LoopbackRouter {
        LoopbackRouter::new(server, Duration::from_secs(1), LinkOptions::default())
    }

    fn headset(output: Option<&str>, input: Option<&str>) -> HardwareDevice {
        HardwareDevice {
            identity: HardwareIdentity::usb("0573", "1573"),
            role: HardwareRole::IntercomHeadset,
            present: true,
            output: output.map(str::to_string),
            input: input.map(str::to_string),
        }
    }

    #[test]
    fn test_link_options_bounds() {
        assert!(LinkOptions::default().validate().is_ok());
        assert!(LinkOptions { latency_ms: 11, sample_rate_hz: 48000 }.validate().is_err());
        assert!(LinkOptions { latency_ms: 5, sample_rate_hz: 44100 }.validate().is_err());
    }

    #[test]
    fn test_headset_topology() {
        let router = router(Arc::new(InMemoryAudioServer::new()));
        let links = router
            .headset_links(
                &headset(Some("usb-out"), Some("usb-in")),
                &VirtualDevice::intercom_speaker(),
                &VirtualDevice::intercom_microphone(),
            )
            .unwrap();

        assert_eq!(links[0].key(), LinkKey::new("intercom-speaker.monitor", "usb-out"));
        assert_eq!(links[0].role, Some(LinkRole::Playback));
        assert_eq!(links[1].key(), LinkKey::new("usb-in", "intercom-microphone"));
        assert_eq!(links[1].role, Some(LinkRole::Capture));
        assert!(links.iter().all(|l| l.options.latency_ms <= MAX_LATENCY_MS));
    }

    #[test]
    fn test_half_headset_is_rejected() {
        let router = router(Arc::new(InMemoryAudioServer::new()));
        let result = router.headset_links(
            &headset(Some("usb-out"), None),
            &VirtualDevice::intercom_speaker(),
            &VirtualDevice::intercom_microphone(),
        );
        assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_ensure_link_is_idempotent() {
        let server = Arc::new(InMemoryAudioServer::new());
        server.add_node(crate::domain::graph::NodeInfo::hardware(
            "usb-out",
            crate::domain::graph::NodeClass::Sink,
        ));
        server.add_node(crate::domain::graph::NodeInfo::hardware(
            "usb-in",
            crate::domain::graph::NodeClass::Source,
        ));
        let router = router(server.clone());

        let existed = router
            .ensure_link("usb-in", "usb-out", LinkOptions::default())
            .await
            .unwrap();
        assert!(!existed);

        let existed = router
            .ensure_link("usb-in", "usb-out", LinkOptions::default())
            .await
            .unwrap();
        assert!(existed);
        assert_eq!(server.loopback_count(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_names_the_pair() {
        let server = Arc::new(InMemoryAudioServer::new());
        let router = router(server);

        // Neither endpoint exists, so the server refuses the module
        let err = router
            .ensure_link("missing-in", "missing-out", LinkOptions::default())
            .await
            .unwrap_err();
        match err {
            AudioError::LinkCreateFailed { link, .. } => {
                assert_eq!(link, LinkKey::new("missing-in", "missing-out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_classify_untagged_links() {
        let router = router(Arc::new(InMemoryAudioServer::new()));
        let speaker = VirtualDevice::intercom_speaker();
        let mic = VirtualDevice::intercom_microphone();
        let untagged = |source: &str, sink: &str| LoopbackInfo {
            module_id: 1,
            source: source.to_string(),
            sink: sink.to_string(),
            latency_ms: 5,
            sample_rate: 48000,
            role: None,
        };

        assert_eq!(
            router.classify(&untagged("intercom-speaker.monitor", "x"), &speaker, &mic),
            Some(LinkRole::Playback)
        );
        assert_eq!(
            router.classify(&untagged("x", "intercom-microphone"), &speaker, &mic),
            Some(LinkRole::Capture)
        );
        assert_eq!(router.classify(&untagged("a", "b"), &speaker, &mic), None);
    }
}
