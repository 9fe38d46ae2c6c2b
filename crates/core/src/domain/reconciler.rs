//! Audio manager reconciler
//!
//! Every run reads the full live graph, diffs it against desired state and
//! applies the minimal delta: devices first, then links, then policy. Runs
//! are serialized by an async mutex; a run arriving within the debounce
//! window of a successful one is coalesced into a no-op.

use crate::domain::audio::{
    AudioError, DeviceKind, HardwareBinding, HardwareDevice, HardwareIdentity, HardwareRole,
    Result, VirtualDevice,
};
use crate::domain::graph::{with_timeout, AudioServer, GraphSnapshot, LinkKey, LoopbackInfo, NodeClass};
use crate::domain::policy::{AccessRule, IsolationPolicyEngine, PolicyReport};
use crate::domain::registry::{EnsureOutcome, VirtualDeviceRegistry};
use crate::domain::router::{LinkOptions, LinkOutcome, LinkRole, LoopbackLink, LoopbackRouter};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

/// Tunables of the reconciler
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerSettings {
    /// Deadline of every audio-server call
    pub call_timeout: Duration,
    /// Window in which a repeated run is coalesced
    pub debounce: Duration,
    pub link: LinkOptions,
    pub speaker: VirtualDevice,
    pub microphone: VirtualDevice,
    pub hardware: Vec<HardwareBinding>,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            debounce: Duration::from_secs(1),
            link: LinkOptions::default(),
            speaker: VirtualDevice::intercom_speaker(),
            microphone: VirtualDevice::intercom_microphone(),
            hardware: vec![
                HardwareBinding {
                    role: HardwareRole::IntercomHeadset,
                    identity: HardwareIdentity::usb("0573", "1573"),
                },
                HardwareBinding {
                    role: HardwareRole::HdmiOutput(0),
                    identity: HardwareIdentity::Port {
                        port: "hdmi-output-0".to_string(),
                    },
                },
                HardwareBinding {
                    role: HardwareRole::HdmiOutput(1),
                    identity: HardwareIdentity::Port {
                        port: "hdmi-output-1".to_string(),
                    },
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Unchanged,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceChange {
    pub name: String,
    pub kind: DeviceKind,
    pub action: ChangeAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkChange {
    pub link: LinkKey,
    pub role: Option<LinkRole>,
    pub action: ChangeAction,
    pub module_id: Option<u32>,
}

/// A user-visible defect left after a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inconsistency {
    /// Only one direction of the headset path exists
    OneSidedLoopback { present: LinkKey, missing: LinkKey },
    /// The headset shows only an output or only an input
    HeadsetIncomplete { identity: String },
}

/// Structured outcome of one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    /// Skipped because a run just succeeded
    pub coalesced: bool,
    pub devices: Vec<DeviceChange>,
    pub links: Vec<LinkChange>,
    pub policy: Option<PolicyReport>,
    pub failures: Vec<AudioError>,
    pub inconsistencies: Vec<Inconsistency>,
    pub headset_present: bool,
    pub hdmi_sinks: Vec<String>,
}

impl ReconcileResult {
    fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Default::default()
        }
    }

    pub fn devices_with(&self, action: ChangeAction) -> usize {
        self.devices.iter().filter(|d| d.action == action).count()
    }

    pub fn links_with(&self, action: ChangeAction) -> usize {
        self.links.iter().filter(|l| l.action == action).count()
    }

    /// No failures and no inconsistencies
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.inconsistencies.is_empty()
    }
}

/// Coalescing wake-up for the reconcile loop
///
/// Any number of fires while a run is in flight leave at most one pending run.
#[derive(Debug, Clone, Default)]
pub struct ReconcileTrigger {
    notify: Arc<Notify>,
}

impl ReconcileTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Orchestrates registry, router and policy engine
pub struct AudioManagerReconciler {
    server: Arc<dyn AudioServer>,
    registry: VirtualDeviceRegistry,
    router: LoopbackRouter,
    policy: IsolationPolicyEngine,
    settings: ReconcilerSettings,
    monitor_enabled: AtomicBool,
    /// Completion time of the last clean run
    gate: Mutex<Option<Instant>>,
}

impl AudioManagerReconciler {
    pub fn new(
        server: Arc<dyn AudioServer>,
        settings: ReconcilerSettings,
        rules: Vec<AccessRule>,
    ) -> Result<Self> {
        settings.link.validate()?;
        settings.speaker.validate()?;
        settings.microphone.validate()?;

        Ok(Self {
            registry: VirtualDeviceRegistry::new(
                server.clone(),
                settings.call_timeout,
                settings.speaker.clone(),
                settings.microphone.clone(),
            ),
            router: LoopbackRouter::new(server.clone(), settings.call_timeout, settings.link),
            policy: IsolationPolicyEngine::new(server.clone(), settings.call_timeout, rules)?,
            server,
            settings,
            monitor_enabled: AtomicBool::new(false),
            gate: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &VirtualDeviceRegistry {
        &self.registry
    }

    pub fn router(&self) -> &LoopbackRouter {
        &self.router
    }

    pub fn policy(&self) -> &IsolationPolicyEngine {
        &self.policy
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Desired state of the self-monitoring link, applied on the next run
    pub fn set_monitor_enabled(&self, enabled: bool) {
        self.monitor_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn monitor_enabled(&self) -> bool {
        self.monitor_enabled.load(Ordering::SeqCst)
    }

    /// Read the live graph; any failure means the server is unavailable
    pub async fn snapshot(&self) -> Result<GraphSnapshot> {
        let unavailable = |e: AudioError| match e {
            AudioError::BackendUnavailable { .. } => e,
            other => AudioError::backend_unavailable(other.to_string()),
        };
        let nodes = with_timeout(self.settings.call_timeout, "list nodes", self.server.list_nodes())
            .await
            .map_err(unavailable)?;
        let loopbacks = with_timeout(
            self.settings.call_timeout,
            "list loopbacks",
            self.server.list_loopbacks(),
        )
        .await
        .map_err(unavailable)?;
        Ok(GraphSnapshot { nodes, loopbacks })
    }

    /// Configured hardware resolved against a snapshot
    pub fn inventory(&self, snapshot: &GraphSnapshot) -> Vec<HardwareDevice> {
        self.settings
            .hardware
            .iter()
            .map(|binding| binding.resolve(&snapshot.nodes))
            .collect()
    }

    /// Reconcile, unless a clean run finished within the debounce window
    pub async fn reconcile(&self) -> Result<ReconcileResult> {
        let mut last = self.gate.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.settings.debounce {
                debug!("Reconcile coalesced into the previous run");
                return Ok(ReconcileResult::coalesced());
            }
        }
        self.run_locked(&mut last).await
    }

    /// Reconcile now, still serialized with other runs
    pub async fn reconcile_now(&self) -> Result<ReconcileResult> {
        let mut last = self.gate.lock().await;
        self.run_locked(&mut last).await
    }

    async fn run_locked(&self, last: &mut Option<Instant>) -> Result<ReconcileResult> {
        let result = self.run_once().await?;
        *last = if result.is_clean() {
            Some(Instant::now())
        } else {
            None
        };
        Ok(result)
    }

    /// Explicit administrative removal, serialized with reconciliation
    pub async fn remove_device(&self, name: &str, kind: DeviceKind) -> Result<()> {
        let mut last = self.gate.lock().await;
        self.registry.remove_device(name, kind).await?;
        *last = None;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn run_once(&self) -> Result<ReconcileResult> {
        let snapshot = self.snapshot().await?;
        let inventory = self.inventory(&snapshot);
        let mut result = ReconcileResult {
            hdmi_sinks: snapshot.hdmi_sinks(),
            ..Default::default()
        };

        let failed_devices = self.reconcile_devices(&snapshot, &mut result).await;
        self.reconcile_links(&snapshot, &inventory, &failed_devices, &mut result)
            .await;

        match self.policy.apply(&inventory).await {
            Ok(report) => {
                result.failures.extend(report.failures.iter().cloned());
                result.policy = Some(report);
            }
            Err(e) => {
                warn!(error = %e, "Failed to apply access policy");
                result.failures.push(e);
            }
        }

        if result.hdmi_sinks.is_empty() {
            warn!("No HDMI sink present");
        }
        info!(
            devices_created = result.devices_with(ChangeAction::Created),
            links_created = result.links_with(ChangeAction::Created),
            links_removed = result.links_with(ChangeAction::Removed),
            failures = result.failures.len(),
            inconsistencies = result.inconsistencies.len(),
            "Reconcile finished"
        );
        Ok(result)
    }

    /// Upsert virtual devices; returns the names that could not be ensured
    async fn reconcile_devices(
        &self,
        snapshot: &GraphSnapshot,
        result: &mut ReconcileResult,
    ) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();

        for node in self.registry.conflicts(&snapshot.nodes) {
            let Some(kind) = node.kind() else { continue };
            warn!(device = %node.name, class = ?node.class, "Removing device created with the wrong class");
            match self.registry.remove_device(&node.name, kind).await {
                Ok(()) => result.devices.push(DeviceChange {
                    name: node.name.clone(),
                    kind,
                    action: ChangeAction::Removed,
                }),
                Err(e) => {
                    error!(device = %node.name, error = %e, "Failed to remove conflicting device");
                    failed.insert(node.name.clone());
                    result.failures.push(e);
                }
            }
        }

        for spec in self.registry.desired() {
            if failed.contains(&spec.name) {
                continue;
            }
            match self.registry.ensure_device_in(spec, &snapshot.nodes).await {
                Ok(outcome) => result.devices.push(DeviceChange {
                    name: spec.name.clone(),
                    kind: spec.kind,
                    action: match outcome {
                        EnsureOutcome::Created => ChangeAction::Created,
                        EnsureOutcome::Existing | EnsureOutcome::Mismatched { .. } => {
                            ChangeAction::Unchanged
                        }
                    },
                }),
                Err(e) => {
                    error!(device = %spec.name, error = %e, "Failed to ensure virtual device");
                    failed.insert(spec.name.clone());
                    result.failures.push(e);
                }
            }
        }
        failed
    }

    async fn reconcile_links(
        &self,
        snapshot: &GraphSnapshot,
        inventory: &[HardwareDevice],
        failed_devices: &BTreeSet<String>,
        result: &mut ReconcileResult,
    ) {
        let speaker = self.registry.speaker();
        let microphone = self.registry.microphone();

        let mut headsets = inventory
            .iter()
            .filter(|d| d.role == HardwareRole::IntercomHeadset && d.present);
        let headset = headsets.next();
        if headsets.next().is_some() {
            warn!("More than one intercom headset present; using the first");
        }
        result.headset_present = headset.is_some();

        let mut desired: Vec<LoopbackLink> = Vec::new();
        let mut pair: Option<[LinkKey; 2]> = None;
        if let Some(headset) = headset {
            match self.router.headset_links(headset, speaker, microphone) {
                Ok(links) => {
                    pair = Some([links[0].key(), links[1].key()]);
                    desired.extend(links);
                }
                Err(e) => {
                    warn!(headset = %headset.identity, error = %e, "Headset is incomplete");
                    result.inconsistencies.push(Inconsistency::HeadsetIncomplete {
                        identity: headset.identity.to_string(),
                    });
                }
            }
            if self.monitor_enabled() {
                desired.extend(self.router.monitor_link(headset));
            }
        }
        let desired_keys: BTreeSet<LinkKey> = desired.iter().map(LoopbackLink::key).collect();

        // Tear down router links that are no longer wanted, and duplicates
        let mut kept: Vec<LoopbackInfo> = Vec::new();
        for link in &snapshot.loopbacks {
            let role = self.router.classify(link, speaker, microphone);
            let duplicate = kept.iter().any(|k| k.key() == link.key());
            let unwanted = role.is_some() && !desired_keys.contains(&link.key());
            if !(duplicate || unwanted) {
                kept.push(link.clone());
                continue;
            }
            match self.router.remove_link(link).await {
                Ok(()) => result.links.push(LinkChange {
                    link: link.key(),
                    role,
                    action: ChangeAction::Removed,
                    module_id: Some(link.module_id),
                }),
                Err(e) => {
                    warn!(link = %link.key(), error = %e, "Failed to remove loopback");
                    result.failures.push(e);
                    kept.push(link.clone());
                }
            }
        }

        let mut present = BTreeSet::new();
        for link in &desired {
            let key = link.key();
            let virtual_missing = [&link.source, &link.sink].into_iter().any(|end| {
                failed_devices.contains(end)
                    || (speaker.monitor_source_name().as_ref() == Some(end)
                        && failed_devices.contains(&speaker.name))
            });
            if virtual_missing {
                debug!(link = %key, "Skipping link to a device that could not be ensured");
                continue;
            }
            match self.router.ensure_link_in(link, &kept).await {
                Ok(outcome) => {
                    let (action, module_id) = match outcome {
                        LinkOutcome::Created(id) => (ChangeAction::Created, id),
                        LinkOutcome::Existing(id) => (ChangeAction::Unchanged, id),
                    };
                    present.insert(key.clone());
                    result.links.push(LinkChange {
                        link: key,
                        role: link.role,
                        action,
                        module_id: Some(module_id),
                    });
                }
                Err(e) => {
                    error!(link = %key, error = %e, "Failed to ensure loopback");
                    result.failures.push(e);
                }
            }
        }

        if let Some([playback, capture]) = pair {
            let inconsistency = match (present.contains(&playback), present.contains(&capture)) {
                (true, false) => Some((playback, capture)),
                (false, true) => Some((capture, playback)),
                _ => None,
            };
            if let Some((present, missing)) = inconsistency {
                error!(present = %present, missing = %missing, "Headset path is one-sided");
                result
                    .inconsistencies
                    .push(Inconsistency::OneSidedLoopback { present, missing });
            }
        }
    }

    fn rearm(&self, trigger: &ReconcileTrigger) {
        let trigger = trigger.clone();
        let debounce = self.settings.debounce.max(Duration::from_millis(50));
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            trigger.fire();
        });
    }

    /// Reconcile on every trigger and on a periodic resync until `shutdown`
    ///
    /// `exclusive` is awaited before each run and the guard it resolves to
    /// is held for the run; `None` means another process is reconciling, and
    /// the run is retried after the debounce window. Desired state kept
    /// outside this process is refreshed there, under the guard.
    pub async fn run<F, L, LF, G>(
        self: Arc<Self>,
        trigger: ReconcileTrigger,
        resync: Duration,
        shutdown: F,
        mut exclusive: L,
    ) where
        F: Future<Output = ()>,
        L: FnMut() -> LF,
        LF: Future<Output = Option<G>>,
    {
        tokio::pin!(shutdown);
        let mut resync = tokio::time::interval(resync);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Reconcile loop stopping");
                    break;
                }
                _ = trigger.wait() => debug!("Reconcile triggered"),
                _ = resync.tick() => debug!("Periodic resync"),
            }

            let Some(guard) = exclusive().await else {
                debug!("Another process is reconciling, retrying later");
                self.rearm(&trigger);
                continue;
            };
            let outcome = self.reconcile().await;
            drop(guard);

            match outcome {
                Ok(result) if result.coalesced => {
                    // Re-arm so an event inside the window is not lost
                    self.rearm(&trigger);
                }
                Ok(result) => {
                    for failure in &result.failures {
                        warn!(error = %failure, "Reconcile step failed");
                    }
                }
                Err(e) => warn!(error = %e, "Reconcile aborted"),
            }
        }
    }
}

/// Whether the microphone also exists as a sink
pub fn microphone_duplicated(snapshot: &GraphSnapshot, microphone: &VirtualDevice) -> bool {
    snapshot.node(&microphone.name, NodeClass::Sink).is_some()
        && snapshot.node(&microphone.name, NodeClass::Source).is_some()
}
