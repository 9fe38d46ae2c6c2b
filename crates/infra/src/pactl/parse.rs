//! Parsing of `pactl --format=json` listings and module arguments

use bridge_audio_core::domain::audio::{AudioError, Result};
use bridge_audio_core::domain::graph::{
    EndpointState, LoopbackInfo, NodeClass, NodeInfo, StreamDirection, StreamInfo,
};
use bridge_audio_core::domain::router::LinkRole;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Property carrying the router's role tag on a loopback's sink input
pub const ROLE_PROPERTY: &str = "bridge.link.role";

const INVALID_INDEX: u64 = u32::MAX as u64;

/// pactl reports "no module" as `PA_INVALID_INDEX`, `"n/a"` or nothing
fn module_index<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .filter(|&n| n < INVALID_INDEX)
            .map(|n| n as u32),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Property values are strings, but be lenient about numbers
fn properties<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelVolume {
    pub value_percent: String,
}

/// One entry of `pactl list sinks` or `pactl list sources`
#[derive(Debug, Clone, Deserialize)]
pub struct PactlNode {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub sample_specification: String,
    #[serde(default, deserialize_with = "module_index")]
    pub owner_module: Option<u32>,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub volume: BTreeMap<String, ChannelVolume>,
    #[serde(default, deserialize_with = "properties")]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub active_port: Option<String>,
    #[serde(default)]
    pub monitor_of_sink: Option<String>,
}

impl PactlNode {
    fn is_monitor(&self) -> bool {
        let monitor_of = self
            .monitor_of_sink
            .as_deref()
            .map(|s| !s.is_empty() && s != "n/a")
            .unwrap_or(false);
        monitor_of
            || self.properties.get("device.class").map(String::as_str) == Some("monitor")
    }

    fn class(&self, listing: Listing) -> NodeClass {
        match listing {
            Listing::Sinks => NodeClass::Sink,
            Listing::Sources if self.is_monitor() => NodeClass::Monitor,
            Listing::Sources => NodeClass::Source,
        }
    }

    /// Average of the per-channel volumes
    pub fn endpoint_state(&self) -> EndpointState {
        let percents: Vec<u32> = self
            .volume
            .values()
            .filter_map(|v| parse_percent(&v.value_percent))
            .collect();
        let volume = if percents.is_empty() {
            100
        } else {
            let sum: u32 = percents.iter().sum();
            (sum as f32 / percents.len() as f32).round().min(100.0) as u8
        };
        EndpointState {
            volume,
            muted: self.mute,
        }
    }

    fn into_node_info(self, listing: Listing) -> NodeInfo {
        let class = self.class(listing);
        let (channels, sample_rate) = parse_sample_spec(&self.sample_specification).unwrap_or((2, 48000));
        let active_port = self.active_port.filter(|p| !p.is_empty() && p != "n/a");
        NodeInfo {
            index: self.index,
            name: self.name,
            class,
            channels,
            sample_rate,
            owner_module: self.owner_module,
            active_port,
            properties: self.properties,
        }
    }
}

/// Which listing a node came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    Sinks,
    Sources,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PactlModule {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub argument: Option<String>,
}

/// One entry of `pactl list sink-inputs` or `pactl list source-outputs`
#[derive(Debug, Clone, Deserialize)]
pub struct PactlStream {
    pub index: u32,
    #[serde(default, deserialize_with = "module_index")]
    pub owner_module: Option<u32>,
    #[serde(default)]
    pub sink: Option<u32>,
    #[serde(default)]
    pub source: Option<u32>,
    #[serde(default, deserialize_with = "properties")]
    pub properties: BTreeMap<String, String>,
}

fn from_json<T: for<'de> Deserialize<'de>>(what: &str, json: &str) -> Result<Vec<T>> {
    serde_json::from_str(json)
        .map_err(|e| AudioError::Parse(format!("pactl {} listing: {}", what, e)))
}

pub fn raw_nodes(listing: Listing, json: &str) -> Result<Vec<PactlNode>> {
    let what = match listing {
        Listing::Sinks => "sinks",
        Listing::Sources => "sources",
    };
    from_json(what, json)
}

pub fn nodes(listing: Listing, json: &str) -> Result<Vec<NodeInfo>> {
    Ok(raw_nodes(listing, json)?
        .into_iter()
        .map(|n| n.into_node_info(listing))
        .collect())
}

/// Loopback modules from `pactl list modules`
pub fn loopbacks(json: &str) -> Result<Vec<LoopbackInfo>> {
    let modules: Vec<PactlModule> = from_json("modules", json)?;
    Ok(modules
        .into_iter()
        .filter(|m| m.name == "module-loopback")
        .filter_map(|m| {
            let args = module_args(m.argument.as_deref().unwrap_or(""));
            let role = args
                .get("sink_input_properties")
                .and_then(|p| module_args(p).get(ROLE_PROPERTY).and_then(|r| LinkRole::parse(r)));
            Some(LoopbackInfo {
                module_id: m.index,
                source: args.get("source")?.clone(),
                sink: args.get("sink")?.clone(),
                latency_ms: args
                    .get("latency_msec")
                    .and_then(|l| l.parse().ok())
                    .unwrap_or(0),
                sample_rate: args.get("rate").and_then(|r| r.parse().ok()).unwrap_or(0),
                role,
            })
        })
        .collect())
}

/// Client and module streams, with targets resolved against `nodes`
pub fn streams(direction: StreamDirection, json: &str, nodes: &[NodeInfo]) -> Result<Vec<StreamInfo>> {
    let what = match direction {
        StreamDirection::Playback => "sink-inputs",
        StreamDirection::Capture => "source-outputs",
    };
    let raw: Vec<PactlStream> = from_json(what, json)?;
    let target_name = |index: u32| {
        nodes
            .iter()
            .find(|n| {
                n.index == index
                    && match direction {
                        StreamDirection::Playback => n.class == NodeClass::Sink,
                        StreamDirection::Capture => n.class != NodeClass::Sink,
                    }
            })
            .map(|n| n.name.clone())
    };

    Ok(raw
        .into_iter()
        .filter_map(|s| {
            let target = match direction {
                StreamDirection::Playback => s.sink,
                StreamDirection::Capture => s.source,
            }
            .and_then(target_name)?;
            let application = s
                .properties
                .get("application.name")
                .or_else(|| s.properties.get("media.name"))
                .cloned()
                .unwrap_or_default();
            Some(StreamInfo {
                index: s.index,
                direction,
                application,
                binary: s.properties.get("application.process.binary").cloned(),
                target,
                owner_module: s.owner_module,
            })
        })
        .collect())
}

/// `s16le 2ch 48000Hz` to `(2, 48000)`
pub fn parse_sample_spec(spec: &str) -> Option<(u16, u32)> {
    let mut channels = None;
    let mut rate = None;
    for part in spec.split_whitespace() {
        if let Some(c) = part.strip_suffix("ch") {
            channels = c.parse().ok();
        } else if let Some(r) = part.strip_suffix("Hz") {
            rate = r.parse().ok();
        }
    }
    Some((channels?, rate?))
}

pub fn parse_percent(value: &str) -> Option<u32> {
    value.trim().trim_end_matches('%').trim().parse().ok()
}

/// Split a module argument string into key/value pairs
///
/// Values may be wrapped in single or double quotes; the quotes are removed.
pub fn module_args(argument: &str) -> BTreeMap<String, String> {
    let mut args = BTreeMap::new();
    let mut chars = argument.chars().peekable();

    loop {
        while chars.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.peek() != Some(&'=') {
            args.insert(key, String::new());
            continue;
        }
        chars.next();

        let mut value = String::new();
        let mut quote = None;
        while let Some(&c) = chars.peek() {
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) => value.push(c),
                None if c == '"' || c == '\'' => quote = Some(c),
                None if c.is_whitespace() => break,
                None => value.push(c),
            }
            chars.next();
        }
        args.insert(key, value);
    }
    args
}

/// Quote a module argument value when it needs it
pub fn quote_arg(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| *c != '\'' && *c != '"').collect();
    if cleaned.chars().any(char::is_whitespace) {
        format!("\"{}\"", cleaned)
    } else {
        cleaned
    }
}
