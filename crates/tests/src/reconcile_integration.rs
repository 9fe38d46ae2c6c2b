//! End-to-end reconciliation scenarios
//!
//! Configuration file, reconciler, reconcile lock, runtime state and the
//! clock precondition wired together the way the daemon and the CLI wire them.

use crate::common::{config, eventually, reconciler_for, HDMI_0, HDMI_1};
use bridge_audio_core::domain::clock::{
    AlsaPcmStanza, ClockDomain, ClockState, ClockSyncBridge, PtpRole, TimestampingMode,
};
use bridge_audio_core::domain::config::ConfigManager;
use bridge_audio_core::domain::graph::NodeClass;
use bridge_audio_core::domain::memory::InMemoryAudioServer;
use bridge_audio_core::domain::reconciler::ChangeAction;
use bridge_audio_core::domain::{
    AudioError, Endpoint, LinkRole, MuteAction, ReconcileTrigger, StatusReporter, VolumeControl,
};
use bridge_audio_infra::ptp::drive;
use bridge_audio_infra::{
    JsonFile, NetworkPcm, ReconcileLock, RuntimeState, SavedDefaults, StateStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

// ============================================================================
// CONFIGURATION INTO RECONCILIATION
// ============================================================================

#[tokio::test]
async fn test_first_boot_writes_config_and_builds_graph() {
    let dir = TempDir::new().unwrap();
    let manager = ConfigManager::new(dir.path().join("audio.toml"));

    let loaded = manager.load_validated().await.unwrap();
    assert!(manager.exists());

    let server = Arc::new(InMemoryAudioServer::appliance());
    let reconciler = reconciler_for(server.clone(), &loaded);
    let result = reconciler.reconcile_now().await.unwrap();

    assert!(result.is_clean());
    assert_eq!(result.devices_with(ChangeAction::Created), 2);
    assert!(server.has_node("intercom-speaker", NodeClass::Sink));
    assert!(server.has_node("intercom-speaker.monitor", NodeClass::Monitor));
    assert!(server.has_node("intercom-microphone", NodeClass::Source));
    assert!(!server.has_node("intercom-microphone", NodeClass::Sink));
}

#[tokio::test]
async fn test_configured_latency_reaches_loopbacks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audio.toml");
    std::fs::write(
        &path,
        r#"
        [app]
        call_timeout_ms = 200
        debounce_ms = 0

        [loopback]
        latency_ms = 7
        sample_rate_hz = 48000
        "#,
    )
    .unwrap();

    let loaded = ConfigManager::new(path).load_validated().await.unwrap();
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();
    reconciler_for(server.clone(), &loaded)
        .reconcile_now()
        .await
        .unwrap();

    let loopbacks = server.loopbacks();
    assert_eq!(loopbacks.len(), 2);
    assert!(loopbacks.iter().all(|l| l.latency_ms == 7));
    assert!(loopbacks.iter().all(|l| l.sample_rate == 48000));
}

#[tokio::test]
async fn test_invalid_config_is_refused_before_touching_the_graph() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audio.toml");
    std::fs::write(&path, "[loopback]\nlatency_ms = 40\nsample_rate_hz = 48000\n").unwrap();

    let manager = ConfigManager::new(path);
    assert!(manager.load_validated().await.is_err());
}

// ============================================================================
// HOT-PLUG
// ============================================================================

#[tokio::test]
async fn test_headset_cycle_leaves_hdmi_alone() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    let reconciler = reconciler_for(server.clone(), &config());

    for _ in 0..3 {
        server.plug_headset();
        let plugged = reconciler.reconcile_now().await.unwrap();
        assert!(plugged.headset_present);
        assert_eq!(server.loopback_count(), 2);

        server.unplug_headset();
        let unplugged = reconciler.reconcile_now().await.unwrap();
        assert!(!unplugged.headset_present);
        assert_eq!(server.loopback_count(), 0);
        assert_eq!(unplugged.hdmi_sinks.len(), 2);
    }

    // HDMI outputs were never linked and the virtual devices survived
    assert!(server
        .loopbacks()
        .iter()
        .all(|l| l.sink != HDMI_0 && l.sink != HDMI_1));
    assert!(server.has_node(HDMI_0, NodeClass::Sink));
    assert!(server.has_node(HDMI_1, NodeClass::Sink));
    assert_eq!(server.virtual_device_count(), 2);
    assert_eq!(server.device_creates(), 2);
}

#[tokio::test]
async fn test_daemon_loop_follows_hotplug() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    let reconciler = Arc::new(reconciler_for(server.clone(), &config()));
    let trigger = ReconcileTrigger::new();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(reconciler.clone().run(
        trigger.clone(),
        Duration::from_secs(3600),
        async move {
            let _ = stop_rx.await;
        },
        || async { Some(()) },
    ));
    assert!(eventually(|| server.virtual_device_count() == 2).await);

    server.plug_headset();
    trigger.fire();
    assert!(eventually(|| server.loopback_count() == 2).await);

    server.unplug_headset();
    trigger.fire();
    assert!(eventually(|| server.loopback_count() == 0).await);

    stop_tx.send(()).unwrap();
    handle.await.unwrap();
}

// ============================================================================
// CROSS-PROCESS EXCLUSION
// ============================================================================

#[tokio::test]
async fn test_daemon_waits_for_foreign_lock_holder() {
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("audio-manager.lock");
    let server = Arc::new(InMemoryAudioServer::appliance());
    let reconciler = Arc::new(reconciler_for(server.clone(), &config()));
    let trigger = ReconcileTrigger::new();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    // Another CLI invocation holds the lock
    let held = ReconcileLock::try_acquire(&lock_path).unwrap();

    let handle = tokio::spawn({
        let lock_path = lock_path.clone();
        reconciler.clone().run(
            trigger.clone(),
            Duration::from_secs(3600),
            async move {
                let _ = stop_rx.await;
            },
            move || std::future::ready(ReconcileLock::try_acquire(&lock_path).ok()),
        )
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.virtual_device_count(), 0);

    drop(held);
    assert!(eventually(|| server.virtual_device_count() == 2).await);

    stop_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_daemon_keeps_monitor_enabled_from_cli() {
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("audio-manager.lock");
    let store = StateStore::new(dir.path().join("audio-state.json"));
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();
    let monitor_links = || {
        server
            .loopbacks()
            .iter()
            .filter(|l| l.role == Some(LinkRole::Monitor))
            .count()
    };

    // The daemon takes the lock and rereads the runtime state before each pass
    let daemon = Arc::new(reconciler_for(server.clone(), &config()));
    let trigger = ReconcileTrigger::new();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn({
        let lock_path = lock_path.clone();
        let store = store.clone();
        let daemon = daemon.clone();
        daemon.clone().run(
            trigger.clone(),
            Duration::from_secs(3600),
            async move {
                let _ = stop_rx.await;
            },
            move || {
                let lock_path = lock_path.clone();
                let store = store.clone();
                let daemon = daemon.clone();
                async move {
                    let lock = ReconcileLock::try_acquire(&lock_path).ok()?;
                    store.refresh(&daemon).await;
                    Some(lock)
                }
            },
        )
    });
    trigger.fire();
    assert!(eventually(|| server.loopback_count() == 2).await);
    assert_eq!(monitor_links(), 0);

    // `monitor enable` from another process
    {
        let cli = reconciler_for(server.clone(), &config());
        let _lock = ReconcileLock::acquire(&lock_path, Duration::from_secs(5))
            .await
            .unwrap();
        store.save(&RuntimeState { monitor_enabled: true }).await.unwrap();
        cli.set_monitor_enabled(true);
        cli.reconcile_now().await.unwrap();
    }
    assert_eq!(monitor_links(), 1);

    // The daemon's next pass keeps the link
    trigger.fire();
    assert!(eventually(|| daemon.monitor_enabled()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(monitor_links(), 1);
    assert_eq!(server.loopback_count(), 3);

    // And follows a later disable written only to disk
    store.save(&RuntimeState { monitor_enabled: false }).await.unwrap();
    trigger.fire();
    assert!(eventually(|| monitor_links() == 0).await);
    assert_eq!(server.loopback_count(), 2);

    stop_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_backend_outage_then_recovery() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();
    let reconciler = reconciler_for(server.clone(), &config());

    server.set_unreachable(true);
    let err = reconciler.reconcile_now().await.unwrap_err();
    assert!(matches!(err, AudioError::BackendUnavailable { .. }));
    assert_eq!(server.device_creates(), 0);

    server.set_unreachable(false);
    let result = reconciler.reconcile_now().await.unwrap();
    assert!(result.is_clean());
    assert_eq!(server.loopback_count(), 2);
}

// ============================================================================
// RUNTIME STATE
// ============================================================================

#[tokio::test]
async fn test_persisted_monitor_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("audio-state.json"));
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();

    // First process enables monitoring and persists it
    let first = reconciler_for(server.clone(), &config());
    first.set_monitor_enabled(true);
    store
        .save(&RuntimeState {
            monitor_enabled: true,
        })
        .await
        .unwrap();
    first.reconcile_now().await.unwrap();
    assert_eq!(server.loopback_count(), 3);

    // A restarted process picks it up again and changes nothing
    let second = reconciler_for(server.clone(), &config());
    second.set_monitor_enabled(store.load().await.monitor_enabled);
    let result = second.reconcile_now().await.unwrap();
    assert_eq!(result.links_with(ChangeAction::Created), 0);
    let monitor = server
        .loopbacks()
        .into_iter()
        .filter(|l| {
            second.router().classify(
                l,
                &second.settings().speaker,
                &second.settings().microphone,
            ) == Some(LinkRole::Monitor)
        })
        .count();
    assert_eq!(monitor, 1);

    // Disabling removes only the monitor link
    second.set_monitor_enabled(false);
    let result = second.reconcile_now().await.unwrap();
    assert_eq!(result.links_with(ChangeAction::Removed), 1);
    assert_eq!(server.loopback_count(), 2);
}

#[tokio::test]
async fn test_saved_defaults_restore_endpoints() {
    let dir = TempDir::new().unwrap();
    let file = JsonFile::new(dir.path().join("intercom.json"));
    let server = Arc::new(InMemoryAudioServer::appliance());
    let cfg = config();
    let reconciler = reconciler_for(server.clone(), &cfg);
    reconciler.reconcile_now().await.unwrap();

    let settings = reconciler.settings();
    let control = VolumeControl::new(
        server.clone(),
        settings.call_timeout,
        &settings.speaker,
        &settings.microphone,
    );
    let reporter = StatusReporter::new(
        server.clone(),
        settings.call_timeout,
        &settings.speaker,
        &settings.microphone,
    );

    control.set_volume(Endpoint::Output, 35).await.unwrap();
    control.set_mute(Endpoint::Input, MuteAction::On).await.unwrap();
    let saved = reporter.status().await.unwrap();
    file.write(&SavedDefaults::new(saved, false)).await.unwrap();

    control.set_volume(Endpoint::Output, 90).await.unwrap();
    control.set_mute(Endpoint::Input, MuteAction::Off).await.unwrap();

    let defaults: SavedDefaults = file.read().await.unwrap().unwrap();
    control.restore(&defaults.status()).await.unwrap();

    let status = reporter.status().await.unwrap();
    assert_eq!(status, saved);
    assert_eq!(status.output.volume, 35);
    assert!(status.input.muted);
}

// ============================================================================
// CLOCK PRECONDITION
// ============================================================================

#[tokio::test]
async fn test_network_pcm_needs_locked_follower() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("ptp-usrvclock");
    let conf = dir.path().join("asound.conf");
    let stanza = AlsaPcmStanza {
        clock_path: socket.clone(),
        ..Default::default()
    };
    std::fs::write(&conf, stanza.render()).unwrap();

    assert!(matches!(
        NetworkPcm::open(&socket, &conf, "dante").await,
        Err(AudioError::ClockUnavailable { .. })
    ));

    let mut bridge = ClockSyncBridge::new(ClockDomain {
        socket_path: socket.clone(),
        role: PtpRole::Follower,
        timestamping_mode: TimestampingMode::HardwareAssisted,
    })
    .unwrap();
    let (tx, rx) = watch::channel(ClockState::Unsynced);
    let log = b"port 1: INITIALIZING to LISTENING on INIT_COMPLETE\n\
                port 1: LISTENING to UNCALIBRATED on RS_SLAVE\n\
                port 1: UNCALIBRATED to SLAVE on MASTER_CLOCK_SELECTED\n";
    drive(&mut bridge, &log[..], &tx).await.unwrap();
    assert!(rx.borrow().is_locked());

    let pcm = NetworkPcm::open(&socket, &conf, "dante").await.unwrap();
    assert_eq!(pcm.device(), "dante");

    // The socket goes away with the bridge
    drop(bridge);
    assert!(matches!(
        NetworkPcm::open(&socket, &conf, "dante").await,
        Err(AudioError::ClockUnavailable { .. })
    ));
}
