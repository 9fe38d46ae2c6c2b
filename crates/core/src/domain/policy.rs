//! Per-application device isolation
//!
//! Rules are declarative: [`IsolationPolicyEngine::apply`] renders them into an
//! access-policy document (installed only when it changes), then enforces
//! usage on the live streams. Enumeration hiding is left to the document and
//! the audio server's own security model; usage routing is what this module
//! guarantees.
//!
//! Default deny: a client stream whose application matches no rule is
//! disconnected. The level meter's own captures of the intercom devices are
//! not clients in this sense.

use crate::domain::audio::{
    AudioError, HardwareDevice, HardwareRole, Result, INTERCOM_MICROPHONE, INTERCOM_SPEAKER,
    METER_CLIENT,
};
use crate::domain::graph::{with_timeout, AudioServer, NodeClass, NodeInfo, StreamDirection, StreamInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Process-name glob (`*` and `?`), matched case-insensitively
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppMatcher(String);

impl AppMatcher {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, candidate: &str) -> bool {
        glob_match(
            self.0.to_ascii_lowercase().as_bytes(),
            candidate.to_ascii_lowercase().as_bytes(),
        )
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// A device an application may use
///
/// In TOML, a plain string names a node; a table such as
/// `{ hdmi_output = 1 }` refers to a hardware role resolved at apply time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceRef {
    Named(String),
    Role(HardwareRole),
}

/// Which devices the applications matching a rule may use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub name: String,
    /// Matched against the stream's application name and process binary
    pub applications: Vec<AppMatcher>,
    pub allowed_devices: Vec<DeviceRef>,
}

impl AccessRule {
    /// Chrome may only use the intercom virtual devices
    pub fn intercom() -> Self {
        Self {
            name: "intercom".to_string(),
            applications: ["chrome*", "google chrome*", "chromium*"]
                .into_iter()
                .map(AppMatcher::new)
                .collect(),
            allowed_devices: vec![
                DeviceRef::Named(INTERCOM_SPEAKER.to_string()),
                DeviceRef::Named(INTERCOM_MICROPHONE.to_string()),
            ],
        }
    }

    /// The display renderer may only use its HDMI output
    pub fn display(hdmi_port: u8) -> Self {
        Self {
            name: "display".to_string(),
            applications: vec![AppMatcher::new("ndi-display*")],
            allowed_devices: vec![DeviceRef::Role(HardwareRole::HdmiOutput(hdmi_port))],
        }
    }

    pub fn builtin(hdmi_port: u8) -> Vec<Self> {
        vec![Self::intercom(), Self::display(hdmi_port)]
    }

    pub fn matches(&self, stream: &StreamInfo) -> bool {
        matches_stream(&self.applications, stream)
    }

    fn names_intercom(&self) -> bool {
        self.allowed_devices
            .iter()
            .any(|d| matches!(d, DeviceRef::Named(n) if n.starts_with("intercom-")))
    }

    fn names_hardware(&self) -> bool {
        self.allowed_devices.iter().any(|d| match d {
            DeviceRef::Role(_) => true,
            DeviceRef::Named(n) => n.starts_with("alsa_"),
        })
    }
}

/// Check a rule set before it is applied
///
/// A rule granting intercom devices must not also grant hardware, and the
/// other way round; the intercom client reaches hardware only through the
/// router's loopbacks.
pub fn validate_rules(rules: &[AccessRule]) -> Result<()> {
    let mut names = BTreeSet::new();
    for rule in rules {
        if !names.insert(rule.name.as_str()) {
            return Err(AudioError::InvalidConfiguration(format!(
                "duplicate access rule {}",
                rule.name
            )));
        }
        if rule.applications.is_empty() {
            return Err(AudioError::InvalidConfiguration(format!(
                "access rule {} matches no application",
                rule.name
            )));
        }
        if rule.names_intercom() && rule.names_hardware() {
            return Err(AudioError::InvalidConfiguration(format!(
                "access rule {} mixes intercom devices with hardware",
                rule.name
            )));
        }
    }
    Ok(())
}

/// A rule with its device references resolved to node names
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRule {
    pub name: String,
    pub applications: Vec<AppMatcher>,
    /// Node names in preference order
    pub allowed: Vec<String>,
}

impl ResolvedRule {
    pub fn allows(&self, device: &str) -> bool {
        self.allowed.iter().any(|d| d == device)
    }
}

/// Outcome of checking one application against one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

/// Rendered access-policy document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDocument {
    pub content: String,
}

/// A stream the engine moved or disconnected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamAction {
    pub stream: u32,
    pub application: String,
    pub from: String,
    /// Destination when moved
    pub to: Option<String>,
}

/// What one policy application changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyReport {
    pub document_changed: bool,
    pub moved: Vec<StreamAction>,
    pub killed: Vec<StreamAction>,
    pub failures: Vec<AudioError>,
}

impl PolicyReport {
    pub fn is_noop(&self) -> bool {
        !self.document_changed && self.moved.is_empty() && self.killed.is_empty()
    }
}

/// Evaluates and enforces access rules
pub struct IsolationPolicyEngine {
    server: Arc<dyn AudioServer>,
    call_timeout: Duration,
    rules: RwLock<Vec<AccessRule>>,
}

impl IsolationPolicyEngine {
    pub fn new(
        server: Arc<dyn AudioServer>,
        call_timeout: Duration,
        rules: Vec<AccessRule>,
    ) -> Result<Self> {
        validate_rules(&rules)?;
        Ok(Self {
            server,
            call_timeout,
            rules: RwLock::new(rules),
        })
    }

    pub fn rules(&self) -> Vec<AccessRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the rule set
    pub fn set_rules(&self, rules: Vec<AccessRule>) -> Result<()> {
        validate_rules(&rules)?;
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = rules;
        Ok(())
    }

    /// Resolve device references against the hardware inventory
    pub fn resolve(&self, inventory: &[HardwareDevice]) -> Vec<ResolvedRule> {
        self.rules()
            .into_iter()
            .map(|rule| {
                let mut allowed = Vec::new();
                for device in &rule.allowed_devices {
                    match device {
                        DeviceRef::Named(name) => allowed.push(name.clone()),
                        DeviceRef::Role(role) => {
                            match inventory.iter().find(|d| d.role == *role && d.present) {
                                Some(hw) => allowed.extend(hw.node_names().map(str::to_string)),
                                None => debug!(rule = %rule.name, role = %role, "Role not present"),
                            }
                        }
                    }
                }
                ResolvedRule {
                    name: rule.name,
                    applications: rule.applications,
                    allowed,
                }
            })
            .collect()
    }

    /// Whether `application` may use `device` under the resolved rules
    pub fn check(resolved: &[ResolvedRule], application: &str, device: &str) -> Decision {
        let stream = StreamInfo {
            index: 0,
            direction: StreamDirection::Playback,
            application: application.to_string(),
            binary: None,
            target: device.to_string(),
            owner_module: None,
        };
        match rule_for(resolved, &stream) {
            Some(rule) if rule.allows(device) => Decision::Allow,
            _ => Decision::Deny,
        }
    }

    /// Devices an application would see if enumeration were filtered
    pub fn enumerate(resolved: &[ResolvedRule], application: &str, nodes: &[NodeInfo]) -> Vec<String> {
        nodes
            .iter()
            .filter(|n| Self::check(resolved, application, &n.name) == Decision::Allow)
            .map(|n| n.name.clone())
            .collect()
    }

    /// Render the resolved rules as a WirePlumber access-policy document
    pub fn render(resolved: &[ResolvedRule]) -> PolicyDocument {
        let mut rules: Vec<&ResolvedRule> = resolved.iter().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = String::new();
        out.push_str("# Generated by media-bridge-audio-manager. Do not edit.\n");
        out.push_str("access.rules = [\n");
        for rule in rules {
            let mut apps: Vec<&str> = rule.applications.iter().map(AppMatcher::as_str).collect();
            apps.sort_unstable();
            let devices: BTreeSet<&str> = rule.allowed.iter().map(String::as_str).collect();

            let _ = writeln!(out, "  {{");
            let _ = writeln!(out, "    # {}", rule.name);
            out.push_str("    matches = [\n");
            for app in apps {
                let _ = writeln!(out, "      {{ application.process.binary = \"~{}\" }}", app);
                let _ = writeln!(out, "      {{ application.name = \"~{}\" }}", app);
            }
            out.push_str("    ]\n");
            let _ = writeln!(
                out,
                "    actions = {{ update-props = {{ media.allowed-targets = \"{}\" }} }}",
                devices.into_iter().collect::<Vec<_>>().join(",")
            );
            out.push_str("  }\n");
        }
        out.push_str("]\n");
        out.push_str("access.default = { media.allowed-targets = \"\" }\n");
        PolicyDocument { content: out }
    }

    /// Apply a new rule set and enforce it
    pub async fn apply_rules(
        &self,
        rules: Vec<AccessRule>,
        inventory: &[HardwareDevice],
    ) -> Result<PolicyReport> {
        self.set_rules(rules)?;
        self.apply(inventory).await
    }

    /// Install the current rules and enforce them on live streams
    #[instrument(skip_all)]
    pub async fn apply(&self, inventory: &[HardwareDevice]) -> Result<PolicyReport> {
        let resolved = self.resolve(inventory);
        let document = Self::render(&resolved);

        let mut report = PolicyReport {
            document_changed: with_timeout(
                self.call_timeout,
                "install access policy",
                self.server.install_access_policy(&document),
            )
            .await?,
            ..Default::default()
        };
        if report.document_changed {
            info!(rules = resolved.len(), "Installed access policy");
        }

        let nodes = with_timeout(self.call_timeout, "list nodes", self.server.list_nodes()).await?;
        let streams =
            with_timeout(self.call_timeout, "list streams", self.server.list_streams()).await?;

        for stream in streams.iter().filter(|s| is_enforced(s)) {
            let rule = rule_for(&resolved, stream);
            if rule.map(|r| r.allows(&stream.target)).unwrap_or(false) {
                continue;
            }

            let destination = rule.and_then(|r| preferred_target(r, stream.direction, &nodes));
            if let Some(to) = destination {
                match with_timeout(
                    self.call_timeout,
                    "move stream",
                    self.server.move_stream(stream, &to),
                )
                .await
                {
                    Ok(()) => {
                        warn!(
                            application = %stream.application,
                            from = %stream.target,
                            to = %to,
                            "Moved stream back inside its access rule"
                        );
                        report.moved.push(action(stream, Some(to)));
                        continue;
                    }
                    Err(e) => debug!(error = %e, "Move failed, disconnecting instead"),
                }
            }

            match with_timeout(self.call_timeout, "kill stream", self.server.kill_stream(stream)).await {
                Ok(()) => {
                    warn!(
                        application = %stream.application,
                        device = %stream.target,
                        matched = rule.is_some(),
                        "Disconnected stream outside its access rule"
                    );
                    report.killed.push(action(stream, None));
                }
                Err(e) => report.failures.push(e),
            }
        }

        Ok(report)
    }

    /// Report client streams attached outside their rule, without changing anything
    pub async fn audit(&self, inventory: &[HardwareDevice]) -> Result<Vec<AudioError>> {
        let resolved = self.resolve(inventory);
        let streams =
            with_timeout(self.call_timeout, "list streams", self.server.list_streams()).await?;

        Ok(streams
            .iter()
            .filter(|s| is_enforced(s))
            .filter(|s| !rule_for(&resolved, s).map(|r| r.allows(&s.target)).unwrap_or(false))
            .map(|s| AudioError::PolicyViolationDetected {
                application: s.application.clone(),
                device: s.target.clone(),
            })
            .collect())
    }
}

/// Client streams other than the level meter reading an intercom device
fn is_enforced(stream: &StreamInfo) -> bool {
    let meter = stream.direction == StreamDirection::Capture
        && stream.application == METER_CLIENT
        && (stream.target == INTERCOM_MICROPHONE
            || stream.target == format!("{}.monitor", INTERCOM_SPEAKER));
    stream.is_client() && !meter
}

fn matches_stream(applications: &[AppMatcher], stream: &StreamInfo) -> bool {
    applications.iter().any(|m| {
        m.matches(&stream.application)
            || stream.binary.as_deref().map(|b| m.matches(b)).unwrap_or(false)
    })
}

fn rule_for<'a>(resolved: &'a [ResolvedRule], stream: &StreamInfo) -> Option<&'a ResolvedRule> {
    resolved
        .iter()
        .find(|rule| matches_stream(&rule.applications, stream))
}

fn preferred_target(rule: &ResolvedRule, direction: StreamDirection, nodes: &[NodeInfo]) -> Option<String> {
    rule.allowed
        .iter()
        .find(|name| {
            nodes.iter().any(|n| {
                &n.name == *name
                    && match direction {
                        StreamDirection::Playback => n.class == NodeClass::Sink,
                        StreamDirection::Capture => {
                            n.class == NodeClass::Source || n.class == NodeClass::Monitor
                        }
                    }
            })
        })
        .cloned()
}

fn action(stream: &StreamInfo, to: Option<String>) -> StreamAction {
    StreamAction {
        stream: stream.index,
        application: stream.application.clone(),
        from: stream.target.clone(),
        to,
    }
}
