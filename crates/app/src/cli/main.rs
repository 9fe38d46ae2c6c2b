//! Media bridge audio manager CLI
//!
//! One-shot commands for the web control layer and a `run` daemon that keeps
//! the audio graph reconciled across hot-plug events.

use anyhow::{bail, Context as _};
use bridge_audio_core::domain::{
    check_clock_socket, AccessRule, AudioError, AudioManagerReconciler, AudioServer, BridgeAudioConfig,
    ClockState, ClockSyncBridge, ConfigManager, ConfigWatcher, DeviceKind, Endpoint,
    InMemoryAudioServer, LevelMeter, LinkRole, MuteAction, ReconcileTrigger, StatusReporter,
    VolumeControl,
};
use bridge_audio_infra::{
    HotplugWatcher, JsonFile, LockError, Pactl, PactlAudioServer, PtpFollower, ReconcileLock,
    RuntimeState, SavedDefaults, StateStore,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long one-shot commands wait for another reconcile to finish
const LOCK_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "media-bridge-audio-manager")]
#[command(about = "Intercom audio devices, routing and isolation for the media bridge", long_about = None)]
struct Cli {
    /// Configuration file (default: /etc/media-bridge/audio.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Work against a simulated appliance instead of the audio server
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Converge devices, links and access rules once
    Setup,
    /// Volume and mute of the intercom endpoints as JSON
    Status,
    /// Reconcile on hot-plug, config change and periodic resync
    Run,
    /// Print intercom levels as JSON lines
    Levels {
        /// Stop after this many readings
        #[arg(long)]
        count: Option<usize>,
    },
    /// List streams that break the access rules; exits 1 if any
    Audit,
    /// Headset self-monitoring
    Monitor {
        #[arg(value_enum)]
        action: MonitorAction,
    },
    /// Set endpoint volume (0-100)
    Volume {
        #[arg(value_enum)]
        endpoint: EndpointArg,
        percent: i64,
    },
    /// Mute, unmute or toggle an endpoint
    Mute {
        #[arg(value_enum)]
        endpoint: EndpointArg,
        action: String,
    },
    /// Save current volume, mute and monitor state
    SaveDefaults,
    /// Re-apply saved defaults
    LoadDefaults,
    /// Remove a virtual device by name
    RemoveDevice {
        name: String,
        #[arg(long, value_enum, default_value = "sink")]
        kind: KindArg,
    },
    /// Follow the PTP daemon and publish the clock socket once locked
    ClockBridge,
    /// Check that the clock socket exists; exits 1 if not
    ClockCheck,
    /// Print the network-audio PCM stanza for /etc/asound.conf
    AlsaConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum MonitorAction {
    Enable,
    Disable,
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum EndpointArg {
    Input,
    Output,
}

impl From<EndpointArg> for Endpoint {
    fn from(arg: EndpointArg) -> Self {
        match arg {
            EndpointArg::Input => Endpoint::Input,
            EndpointArg::Output => Endpoint::Output,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Sink,
    Source,
}

impl From<KindArg> for DeviceKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Sink => DeviceKind::Sink,
            KindArg::Source => DeviceKind::Source,
        }
    }
}

/// Everything a command needs
struct Context {
    manager: ConfigManager,
    config: BridgeAudioConfig,
    server: Arc<dyn AudioServer>,
    state: StateStore,
    dry_run: bool,
}

impl Context {
    async fn new(cli: &Cli) -> anyhow::Result<Self> {
        let manager = ConfigManager::locate(cli.config.clone());
        let config = manager
            .load_validated()
            .await
            .with_context(|| format!("invalid configuration {}", manager.config_path().display()))?;

        let server: Arc<dyn AudioServer> = if cli.dry_run {
            let simulated = InMemoryAudioServer::appliance();
            simulated.plug_headset();
            Arc::new(simulated)
        } else {
            Arc::new(PactlAudioServer::new(
                Pactl::new(),
                config.app.policy_file.clone(),
            ))
        };

        let ctx = Self {
            state: StateStore::new(config.app.state_file.clone()),
            manager,
            config,
            server,
            dry_run: cli.dry_run,
        };
        if ctx.dry_run {
            // The simulated appliance starts as if setup had run
            ctx.reconciler().await?.reconcile_now().await?;
        }
        Ok(ctx)
    }

    fn call_timeout(&self) -> Duration {
        self.config.app.call_timeout()
    }

    async fn runtime_state(&self) -> RuntimeState {
        if self.dry_run {
            RuntimeState::default()
        } else {
            self.state.load().await
        }
    }

    async fn save_runtime_state(&self, state: RuntimeState) -> anyhow::Result<()> {
        if self.dry_run {
            debug!("Dry run, not persisting runtime state");
            return Ok(());
        }
        self.state.save(&state).await?;
        Ok(())
    }

    async fn reconciler(&self) -> anyhow::Result<Arc<AudioManagerReconciler>> {
        let reconciler = AudioManagerReconciler::new(
            self.server.clone(),
            self.config.reconciler_settings(),
            self.config.policy.effective_rules(),
        )?;
        reconciler.set_monitor_enabled(self.runtime_state().await.monitor_enabled);
        Ok(Arc::new(reconciler))
    }

    /// The cross-process lock; `None` in dry runs
    async fn lock(&self) -> Result<Option<ReconcileLock>, LockError> {
        if self.dry_run {
            return Ok(None);
        }
        ReconcileLock::acquire(&self.config.app.lock_file, LOCK_WAIT)
            .await
            .map(Some)
    }

    fn status_reporter(&self) -> StatusReporter {
        StatusReporter::new(
            self.server.clone(),
            self.call_timeout(),
            &self.config.intercom.speaker,
            &self.config.intercom.microphone,
        )
    }

    fn volume_control(&self) -> VolumeControl {
        VolumeControl::new(
            self.server.clone(),
            self.call_timeout(),
            &self.config.intercom.speaker,
            &self.config.intercom.microphone,
        )
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
}

async fn setup(ctx: &Context) -> anyhow::Result<ExitCode> {
    let _lock = match ctx.lock().await {
        Ok(lock) => lock,
        Err(LockError::Busy { path }) => {
            warn!(path = %path.display(), "Another reconcile still holds the lock, leaving it to converge");
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e.into()),
    };

    let reconciler = ctx.reconciler().await?;
    match reconciler.reconcile_now().await {
        Ok(result) => {
            for failure in &result.failures {
                warn!(error = %failure, "Setup step failed");
            }
            print_json(&result)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ AudioError::BackendUnavailable { .. }) => {
            error!(error = %e, "Audio server unavailable");
            print_json(&json!({ "error": e }))?;
            Ok(ExitCode::from(2))
        }
        Err(e) => {
            // Anything else is reported, not fatal
            warn!(error = %e, "Setup incomplete");
            print_json(&json!({ "error": e }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_daemon(ctx: &Context) -> anyhow::Result<ExitCode> {
    let reconciler = ctx.reconciler().await?;
    let trigger = ReconcileTrigger::new();
    trigger.fire();

    let hotplug = if ctx.dry_run {
        None
    } else {
        Some(HotplugWatcher::new(Pactl::new()).spawn(trigger.clone()))
    };

    let config_path = ctx.manager.config_path().to_path_buf();
    let reload = match ConfigWatcher::new(config_path.clone()).await {
        Ok(watcher) => {
            let reconciler = reconciler.clone();
            let trigger = trigger.clone();
            let current = ctx.config.clone();
            let lock_file = (!ctx.dry_run).then(|| ctx.config.app.lock_file.clone());
            Some(tokio::spawn(async move {
                let mut changes = watcher.subscribe();
                let manager = ConfigManager::new(config_path);
                while changes.recv().await.is_ok() {
                    match manager.load_validated().await {
                        Ok(config) => {
                            if config.reconciler_settings() != current.reconciler_settings() {
                                warn!("Device or link settings changed, restart to apply them");
                            }
                            swap_rules(
                                &reconciler,
                                config.policy.effective_rules(),
                                lock_file.as_deref(),
                            )
                            .await;
                            trigger.fire();
                        }
                        Err(e) => warn!(error = %e, "Ignoring invalid configuration change"),
                    }
                }
            }))
        }
        Err(e) => {
            warn!(error = %e, "Config hot reload unavailable");
            None
        }
    };

    let lock_file = ctx.config.app.lock_file.clone();
    let state = (!ctx.dry_run).then(|| ctx.state.clone());
    let daemon = reconciler.clone();
    let exclusive = move || {
        let lock_file = lock_file.clone();
        let state = state.clone();
        let daemon = daemon.clone();
        async move {
            let Some(state) = state else {
                return Some(None);
            };
            let lock = match ReconcileLock::try_acquire(&lock_file) {
                Ok(lock) => Some(lock),
                Err(LockError::Busy { .. }) => return None,
                Err(e) => {
                    warn!(error = %e, "Reconciling without the cross-process lock");
                    None
                }
            };
            // The CLI persists monitor changes under the same lock
            state.refresh(&daemon).await;
            Some(lock)
        }
    };

    info!(
        resync_secs = ctx.config.app.resync_interval_secs,
        "Audio manager running"
    );
    reconciler
        .run(
            trigger,
            ctx.config.app.resync_interval(),
            shutdown_signal(),
            exclusive,
        )
        .await;

    for task in [hotplug, reload].into_iter().flatten() {
        task.abort();
    }
    Ok(ExitCode::SUCCESS)
}

/// Install reloaded access rules and enforce them on live streams
///
/// Without the lock or a readable graph the rules are only swapped, and the
/// next pass enforces them.
async fn swap_rules(
    reconciler: &AudioManagerReconciler,
    rules: Vec<AccessRule>,
    lock_file: Option<&Path>,
) {
    let lock = match lock_file {
        Some(path) => match ReconcileLock::acquire(path, LOCK_WAIT).await {
            Ok(lock) => Some(Some(lock)),
            Err(e) => {
                warn!(error = %e, "Cannot take the reconcile lock for new access rules");
                None
            }
        },
        None => Some(None),
    };
    let inventory = match lock {
        Some(_) => match reconciler.snapshot().await {
            Ok(snapshot) => Some(reconciler.inventory(&snapshot)),
            Err(e) => {
                warn!(error = %e, "Cannot read the audio graph for new access rules");
                None
            }
        },
        None => None,
    };

    let Some(inventory) = inventory else {
        if let Err(e) = reconciler.policy().set_rules(rules) {
            warn!(error = %e, "Rejected new access rules");
        }
        return;
    };
    match reconciler.policy().apply_rules(rules, &inventory).await {
        Ok(report) => info!(
            moved = report.moved.len(),
            killed = report.killed.len(),
            "Applied new access rules"
        ),
        Err(e) => warn!(error = %e, "New access rules not applied"),
    }
    drop(lock);
}

async fn levels(ctx: &Context, count: Option<usize>) -> anyhow::Result<ExitCode> {
    let meter = LevelMeter::new(
        ctx.server.clone(),
        ctx.call_timeout(),
        ctx.config.app.meter_rate_hz,
        ctx.config.app.meter_decay_rate,
        &ctx.config.intercom.speaker,
        &ctx.config.intercom.microphone,
    );
    let (mut rx, handle) = meter.spawn();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut printed = 0;
    while count.map(|c| printed < c).unwrap_or(true) {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *rx.borrow_and_update();
                println!("{}", serde_json::to_string(&snapshot)?);
                printed += 1;
            }
        }
    }
    handle.abort();
    Ok(ExitCode::SUCCESS)
}

async fn audit(ctx: &Context) -> anyhow::Result<ExitCode> {
    let reconciler = ctx.reconciler().await?;
    let snapshot = reconciler.snapshot().await?;
    let inventory = reconciler.inventory(&snapshot);
    let violations = reconciler.policy().audit(&inventory).await?;
    print_json(&violations)?;
    Ok(if violations.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn monitor(ctx: &Context, action: MonitorAction) -> anyhow::Result<ExitCode> {
    let mut state = ctx.runtime_state().await;
    let reconciler = ctx.reconciler().await?;

    if let MonitorAction::Enable | MonitorAction::Disable = action {
        // Saved under the lock so a running daemon's next pass sees it
        let _lock = ctx.lock().await?;
        state.monitor_enabled = matches!(action, MonitorAction::Enable);
        ctx.save_runtime_state(state).await?;
        reconciler.set_monitor_enabled(state.monitor_enabled);

        let result = reconciler.reconcile_now().await?;
        for failure in &result.failures {
            warn!(error = %failure, "Reconcile step failed");
        }
    }

    let snapshot = reconciler.snapshot().await?;
    let settings = reconciler.settings();
    let present = snapshot.loopbacks.iter().any(|link| {
        reconciler
            .router()
            .classify(link, &settings.speaker, &settings.microphone)
            == Some(LinkRole::Monitor)
    });
    print_json(&json!({ "enabled": state.monitor_enabled, "present": present }))?;
    Ok(ExitCode::SUCCESS)
}

async fn save_defaults(ctx: &Context) -> anyhow::Result<ExitCode> {
    let status = ctx.status_reporter().status().await?;
    let defaults = SavedDefaults::new(status, ctx.runtime_state().await.monitor_enabled);
    if ctx.dry_run {
        print_json(&defaults)?;
        return Ok(ExitCode::SUCCESS);
    }
    JsonFile::new(ctx.config.app.defaults_file.clone())
        .write(&defaults)
        .await?;
    info!(path = %ctx.config.app.defaults_file.display(), "Defaults saved");
    print_json(&defaults)?;
    Ok(ExitCode::SUCCESS)
}

async fn load_defaults(ctx: &Context) -> anyhow::Result<ExitCode> {
    let file = JsonFile::new(ctx.config.app.defaults_file.clone());
    let Some(defaults) = file.read::<SavedDefaults>().await? else {
        bail!("no saved defaults at {}", file.path().display());
    };

    ctx.volume_control().restore(&defaults.status()).await?;

    let mut state = ctx.runtime_state().await;
    if state.monitor_enabled != defaults.monitor_enabled {
        let _lock = ctx.lock().await?;
        state.monitor_enabled = defaults.monitor_enabled;
        ctx.save_runtime_state(state).await?;
        let reconciler = ctx.reconciler().await?;
        reconciler.reconcile_now().await?;
    }
    print_json(&defaults)?;
    Ok(ExitCode::SUCCESS)
}

async fn clock_bridge(ctx: &Context) -> anyhow::Result<ExitCode> {
    let mut bridge = ClockSyncBridge::new(ctx.config.clock.domain())?;
    let (tx, mut rx) = watch::channel(ClockState::Unsynced);
    let printer = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            if let Ok(line) = serde_json::to_string(&state) {
                println!("{}", line);
            }
        }
    });

    let follower = PtpFollower::new(ctx.config.clock.ptp_unit.clone());
    let outcome = tokio::select! {
        result = follower.follow(&mut bridge, &tx) => result,
        _ = shutdown_signal() => Ok(()),
    };
    drop(tx);
    let _ = printer.await;
    outcome?;
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    // Commands that need no audio server
    match &cli.command {
        Command::ClockCheck => {
            let config = ConfigManager::locate(cli.config.clone()).load_validated().await?;
            let path = &config.clock.socket_path;
            let available = check_clock_socket(path).is_ok();
            print_json(&json!({ "path": path, "available": available }))?;
            return Ok(if available {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Command::AlsaConfig => {
            let config = ConfigManager::locate(cli.config.clone()).load_validated().await?;
            print!("{}", config.clock.pcm.render());
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let ctx = Context::new(&cli).await?;
    match cli.command {
        Command::Setup => setup(&ctx).await,
        Command::Status => {
            print_json(&ctx.status_reporter().status().await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run => run_daemon(&ctx).await,
        Command::Levels { count } => levels(&ctx, count).await,
        Command::Audit => audit(&ctx).await,
        Command::Monitor { action } => monitor(&ctx, action).await,
        Command::Volume { endpoint, percent } => {
            let volume = ctx.volume_control().set_volume(endpoint.into(), percent).await?;
            print_json(&json!({ "endpoint": Endpoint::from(endpoint), "volume": volume }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Mute { endpoint, action } => {
            let action: MuteAction = action.parse()?;
            let muted = ctx.volume_control().set_mute(endpoint.into(), action).await?;
            print_json(&json!({ "endpoint": Endpoint::from(endpoint), "muted": muted }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::SaveDefaults => save_defaults(&ctx).await,
        Command::LoadDefaults => load_defaults(&ctx).await,
        Command::RemoveDevice { name, kind } => {
            let reconciler = ctx.reconciler().await?;
            let _lock = ctx.lock().await?;
            reconciler.remove_device(&name, kind.into()).await?;
            print_json(&json!({ "removed": name }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::ClockBridge => clock_bridge(&ctx).await,
        Command::ClockCheck | Command::AlsaConfig => Ok(ExitCode::SUCCESS),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
