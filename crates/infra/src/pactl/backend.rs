//! [`AudioServer`] over PipeWire's pulse interface

use super::command::{s16le_peak, Pactl};
use super::parse::{self, quote_arg, Listing, PactlNode, ROLE_PROPERTY};
use crate::state::write_if_changed;
use async_trait::async_trait;
use bridge_audio_core::domain::audio::{AudioError, DeviceKind, Result, VirtualDevice};
use bridge_audio_core::domain::graph::{
    AudioServer, EndpointState, LoopbackInfo, NodeInfo, StreamDirection, StreamInfo,
};
use bridge_audio_core::domain::policy::PolicyDocument;
use bridge_audio_core::domain::router::LoopbackLink;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// 100 ms of 8 kHz mono s16le
const PEAK_WINDOW_BYTES: usize = 1600;

pub struct PactlAudioServer {
    pactl: Pactl,
    policy_path: PathBuf,
}

impl PactlAudioServer {
    pub fn new(pactl: Pactl, policy_path: impl Into<PathBuf>) -> Self {
        Self {
            pactl,
            policy_path: policy_path.into(),
        }
    }

    pub fn policy_path(&self) -> &Path {
        &self.policy_path
    }

    async fn raw_nodes(&self, listing: Listing) -> Result<Vec<PactlNode>> {
        let what = match listing {
            Listing::Sinks => "sinks",
            Listing::Sources => "sources",
        };
        let json = self.pactl.list(what).await?;
        parse::raw_nodes(listing, &json)
    }

    async fn raw_node(&self, name: &str, kind: DeviceKind) -> Result<PactlNode> {
        let listing = match kind {
            DeviceKind::Sink => Listing::Sinks,
            DeviceKind::Source => Listing::Sources,
        };
        self.raw_nodes(listing)
            .await?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))
    }

    /// `set-sink-volume`, `set-source-mute`, ...
    fn setter(kind: DeviceKind, property: &str) -> String {
        match kind {
            DeviceKind::Sink => format!("set-sink-{}", property),
            DeviceKind::Source => format!("set-source-{}", property),
        }
    }

    fn not_found(name: &str) -> impl FnOnce(AudioError) -> AudioError + '_ {
        move |e| match e {
            AudioError::CommandFailed(m) if m.contains("No such entity") => {
                AudioError::DeviceNotFound(name.to_string())
            }
            other => other,
        }
    }
}

/// Arguments of `module-null-sink` for a virtual device
pub fn null_sink_args(device: &VirtualDevice) -> Vec<String> {
    let mut args = Vec::new();
    if device.kind == DeviceKind::Source {
        args.push("media.class=Audio/Source/Virtual".to_string());
    }
    args.push(format!("sink_name={}", device.name));
    args.push(format!("channels={}", device.channels.count()));
    args.push(format!("rate={}", device.sample_rate.hz()));
    if device.channels.count() == 1 {
        args.push("channel_map=mono".to_string());
    }
    args.push(format!(
        "sink_properties='device.description={}'",
        quote_arg(&device.description)
    ));
    args
}

/// Arguments of `module-loopback` for a link
pub fn loopback_args(link: &LoopbackLink) -> Vec<String> {
    let mut args = vec![
        format!("source={}", link.source),
        format!("sink={}", link.sink),
        format!("latency_msec={}", link.options.latency_ms),
        format!("rate={}", link.options.sample_rate_hz),
        "source_dont_move=true".to_string(),
        "sink_dont_move=true".to_string(),
    ];
    // The microphone is an Audio/Source/Virtual node; naming it as the
    // playback target lets the loopback feed its input ports
    let mut properties = vec![format!("target.object={}", link.sink)];
    if let Some(role) = link.role {
        properties.push(format!("{}={}", ROLE_PROPERTY, role));
    }
    args.push(format!("sink_input_properties='{}'", properties.join(" ")));
    args
}

#[async_trait]
impl AudioServer for PactlAudioServer {
    async fn ping(&self) -> Result<()> {
        self.pactl.run(&["info".to_string()]).await.map(|_| ())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut nodes = parse::nodes(Listing::Sinks, &self.pactl.list("sinks").await?)?;
        nodes.extend(parse::nodes(
            Listing::Sources,
            &self.pactl.list("sources").await?,
        )?);
        Ok(nodes)
    }

    async fn list_loopbacks(&self) -> Result<Vec<LoopbackInfo>> {
        parse::loopbacks(&self.pactl.list("modules").await?)
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>> {
        let nodes = self.list_nodes().await?;
        let mut streams = parse::streams(
            StreamDirection::Playback,
            &self.pactl.list("sink-inputs").await?,
            &nodes,
        )?;
        streams.extend(parse::streams(
            StreamDirection::Capture,
            &self.pactl.list("source-outputs").await?,
            &nodes,
        )?);
        Ok(streams)
    }

    #[instrument(skip(self, device), fields(name = %device.name, kind = %device.kind))]
    async fn create_virtual_device(&self, device: &VirtualDevice) -> Result<u32> {
        let module = self
            .pactl
            .load_module("module-null-sink", null_sink_args(device))
            .await?;
        info!(module, "Loaded null sink module");
        Ok(module)
    }

    async fn remove_virtual_device(&self, name: &str, kind: DeviceKind) -> Result<()> {
        let class = kind.node_class();
        let module = self
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.name == name && n.class == class)
            .and_then(|n| n.owner_module)
            .ok_or_else(|| AudioError::DeviceNotFound(format!("{} {}", kind, name)))?;
        self.pactl.unload_module(module).await
    }

    #[instrument(skip(self, link), fields(link = %link.key()))]
    async fn create_loopback(&self, link: &LoopbackLink) -> Result<u32> {
        let module = self
            .pactl
            .load_module("module-loopback", loopback_args(link))
            .await?;
        info!(module, "Loaded loopback module");
        Ok(module)
    }

    async fn destroy_loopback(&self, module_id: u32) -> Result<()> {
        self.pactl.unload_module(module_id).await
    }

    async fn move_stream(&self, stream: &StreamInfo, target: &str) -> Result<()> {
        let verb = match stream.direction {
            StreamDirection::Playback => "move-sink-input",
            StreamDirection::Capture => "move-source-output",
        };
        self.pactl
            .run(&[verb.to_string(), stream.index.to_string(), target.to_string()])
            .await
            .map_err(Self::not_found(target))
            .map(|_| ())
    }

    async fn kill_stream(&self, stream: &StreamInfo) -> Result<()> {
        let verb = match stream.direction {
            StreamDirection::Playback => "kill-sink-input",
            StreamDirection::Capture => "kill-source-output",
        };
        self.pactl
            .run(&[verb.to_string(), stream.index.to_string()])
            .await
            .map(|_| ())
    }

    async fn install_access_policy(&self, document: &PolicyDocument) -> Result<bool> {
        write_if_changed(&self.policy_path, &document.content)
            .await
            .map_err(|e| {
                AudioError::CommandFailed(format!(
                    "writing {}: {}",
                    self.policy_path.display(),
                    e
                ))
            })
    }

    async fn endpoint_state(&self, name: &str, kind: DeviceKind) -> Result<EndpointState> {
        Ok(self.raw_node(name, kind).await?.endpoint_state())
    }

    async fn set_volume(&self, name: &str, kind: DeviceKind, volume: u8) -> Result<()> {
        self.pactl
            .run(&[
                Self::setter(kind, "volume"),
                name.to_string(),
                format!("{}%", volume.min(100)),
            ])
            .await
            .map_err(Self::not_found(name))
            .map(|_| ())
    }

    async fn set_mute(&self, name: &str, kind: DeviceKind, muted: bool) -> Result<()> {
        self.pactl
            .run(&[
                Self::setter(kind, "mute"),
                name.to_string(),
                if muted { "1" } else { "0" }.to_string(),
            ])
            .await
            .map_err(Self::not_found(name))
            .map(|_| ())
    }

    async fn peak_level(&self, name: &str, kind: DeviceKind) -> Result<f32> {
        let device = match kind {
            DeviceKind::Sink => format!("{}.monitor", name),
            DeviceKind::Source => name.to_string(),
        };
        let frames = self.pactl.record(&device, PEAK_WINDOW_BYTES).await?;
        Ok(s16le_peak(&frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_audio_core::domain::router::{LinkOptions, LinkRole};

    #[test]
    fn test_null_sink_args() {
        let args = null_sink_args(&VirtualDevice::intercom_microphone());
        assert_eq!(args[0], "media.class=Audio/Source/Virtual");
        assert!(args.contains(&"sink_name=intercom-microphone".to_string()));
        assert!(args.contains(&"channels=1".to_string()));
        assert!(args.contains(&"rate=48000".to_string()));

        let args = null_sink_args(&VirtualDevice::intercom_speaker());
        assert!(!args.iter().any(|a| a.starts_with("media.class")));
        assert!(args.contains(&"channels=2".to_string()));
    }

    #[test]
    fn test_loopback_args_round_trip_through_parser() {
        let link = LoopbackLink {
            source: "intercom-speaker.monitor".to_string(),
            sink: "alsa_output.usb".to_string(),
            role: Some(LinkRole::Playback),
            options: LinkOptions::default(),
        };
        let argument = loopback_args(&link).join(" ");
        let json = serde_json::json!([
            {"index": 7, "name": "module-loopback", "argument": argument}
        ])
        .to_string();

        let parsed = parse::loopbacks(&json).unwrap();
        assert_eq!(parsed[0].key(), link.key());
        assert_eq!(parsed[0].role, Some(LinkRole::Playback));
        assert_eq!(parsed[0].latency_ms, 5);
        assert_eq!(parsed[0].sample_rate, 48000);
    }

    #[test]
    fn test_capture_loopback_targets_virtual_source() {
        let link = LoopbackLink {
            source: "alsa_input.usb".to_string(),
            sink: "intercom-microphone".to_string(),
            role: Some(LinkRole::Capture),
            options: LinkOptions::default(),
        };
        let argument = loopback_args(&link).join(" ");
        let args = parse::module_args(&argument);
        let properties = parse::module_args(&args["sink_input_properties"]);
        assert_eq!(args["sink"], "intercom-microphone");
        assert_eq!(properties["target.object"], "intercom-microphone");
        assert_eq!(properties[ROLE_PROPERTY], "capture");

        let json = serde_json::json!([
            {"index": 8, "name": "module-loopback", "argument": argument}
        ])
        .to_string();
        assert_eq!(parse::loopbacks(&json).unwrap()[0].role, Some(LinkRole::Capture));
    }

    #[test]
    fn test_volume_verbs() {
        assert_eq!(
            PactlAudioServer::setter(DeviceKind::Source, "volume"),
            "set-source-volume"
        );
        assert_eq!(PactlAudioServer::setter(DeviceKind::Sink, "mute"), "set-sink-mute");
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let server = PactlAudioServer::new(
            Pactl::with_programs("/nonexistent/pactl", "/nonexistent/parec"),
            "/nonexistent/policy.conf",
        );
        assert!(matches!(
            server.list_nodes().await,
            Err(AudioError::BackendUnavailable { .. })
        ));
    }
}
