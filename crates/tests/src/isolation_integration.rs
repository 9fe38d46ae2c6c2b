//! Application isolation scenarios
//!
//! The intercom client must only ever reach the intercom virtual devices and
//! the display renderer only its HDMI output, whatever the clients do between
//! reconciliations.

use crate::common::{config, reconciler_for, HDMI_0, HDMI_1};
use bridge_audio_core::domain::graph::StreamDirection;
use bridge_audio_core::domain::memory::InMemoryAudioServer;
use bridge_audio_core::domain::{
    AccessRule, AppMatcher, AudioError, Decision, DeviceRef, IsolationPolicyEngine, METER_CLIENT,
};
use std::sync::Arc;

fn target_of(server: &InMemoryAudioServer, index: u32) -> Option<String> {
    server
        .streams()
        .into_iter()
        .find(|s| s.index == index)
        .map(|s| s.target)
}

// ============================================================================
// ENFORCEMENT
// ============================================================================

#[tokio::test]
async fn test_intercom_client_is_pulled_off_hardware() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();
    let reconciler = reconciler_for(server.clone(), &config());
    reconciler.reconcile_now().await.unwrap();

    let playback = server.open_stream("Google Chrome", Some("chrome"), StreamDirection::Playback, HDMI_1);
    let capture = server.open_stream(
        "Google Chrome",
        Some("chrome"),
        StreamDirection::Capture,
        server.headset_input(),
    );
    let result = reconciler.reconcile_now().await.unwrap();

    let report = result.policy.unwrap();
    assert_eq!(report.moved.len(), 2);
    assert!(report.killed.is_empty());
    assert_eq!(target_of(&server, playback).as_deref(), Some("intercom-speaker"));
    assert_eq!(target_of(&server, capture).as_deref(), Some("intercom-microphone"));
}

#[tokio::test]
async fn test_display_renderer_keeps_its_output() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    let reconciler = reconciler_for(server.clone(), &config());
    reconciler.reconcile_now().await.unwrap();

    let on_display = server.open_stream("ndi-display", None, StreamDirection::Playback, HDMI_0);
    let on_other = server.open_stream("ndi-display", None, StreamDirection::Playback, HDMI_1);
    let on_intercom =
        server.open_stream("ndi-display", None, StreamDirection::Playback, "intercom-speaker");
    reconciler.reconcile_now().await.unwrap();

    assert_eq!(target_of(&server, on_display).as_deref(), Some(HDMI_0));
    assert_eq!(target_of(&server, on_other).as_deref(), Some(HDMI_0));
    assert_eq!(target_of(&server, on_intercom).as_deref(), Some(HDMI_0));
}

#[tokio::test]
async fn test_unknown_clients_are_disconnected() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();
    let reconciler = reconciler_for(server.clone(), &config());
    reconciler.reconcile_now().await.unwrap();

    let stray = server.open_stream("aplay", Some("aplay"), StreamDirection::Playback, HDMI_0);
    let result = reconciler.reconcile_now().await.unwrap();

    assert_eq!(result.policy.unwrap().killed.len(), 1);
    assert!(target_of(&server, stray).is_none());
    // Loopback streams belong to the router and are never touched
    assert_eq!(server.loopback_count(), 2);
    assert_eq!(
        server.streams().iter().filter(|s| s.owner_module.is_some()).count(),
        4
    );
}

#[tokio::test]
async fn test_display_port_follows_configuration() {
    let mut cfg = config();
    cfg.policy.display_hdmi_output = 1;
    cfg.validate().unwrap();

    let server = Arc::new(InMemoryAudioServer::appliance());
    let reconciler = reconciler_for(server.clone(), &cfg);
    reconciler.reconcile_now().await.unwrap();

    let stream = server.open_stream("ndi-display", None, StreamDirection::Playback, HDMI_0);
    reconciler.reconcile_now().await.unwrap();
    assert_eq!(target_of(&server, stream).as_deref(), Some(HDMI_1));
}

#[tokio::test]
async fn test_configured_rule_admits_operator_console() {
    let mut cfg = config();
    cfg.policy.rules.push(AccessRule {
        name: "operator-console".to_string(),
        applications: vec![AppMatcher::new("firefox*")],
        allowed_devices: vec![DeviceRef::Named("intercom-speaker".to_string())],
    });
    cfg.validate().unwrap();

    let server = Arc::new(InMemoryAudioServer::appliance());
    let reconciler = reconciler_for(server.clone(), &cfg);
    reconciler.reconcile_now().await.unwrap();

    let console = server.open_stream("firefox", None, StreamDirection::Playback, "intercom-speaker");
    let hdmi = server.open_stream("Firefox", None, StreamDirection::Playback, HDMI_1);
    let result = reconciler.reconcile_now().await.unwrap();

    let report = result.policy.unwrap();
    assert!(report.killed.is_empty());
    assert_eq!(report.moved.len(), 1);
    assert_eq!(target_of(&server, console).as_deref(), Some("intercom-speaker"));
    assert_eq!(target_of(&server, hdmi).as_deref(), Some("intercom-speaker"));
}

#[tokio::test]
async fn test_level_meter_capture_is_left_alone() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();
    let reconciler = reconciler_for(server.clone(), &config());
    reconciler.reconcile_now().await.unwrap();

    let meter = server.open_stream(METER_CLIENT, Some("parec"), StreamDirection::Capture, "intercom-microphone");
    let untagged = server.open_stream("parec", Some("parec"), StreamDirection::Capture, "intercom-microphone");
    let result = reconciler.reconcile_now().await.unwrap();

    let report = result.policy.unwrap();
    assert_eq!(report.killed.len(), 1);
    assert_eq!(report.killed[0].stream, untagged);
    assert_eq!(target_of(&server, meter).as_deref(), Some("intercom-microphone"));

    // A second pass, as the hot-plug trigger would cause, leaves it too
    let again = reconciler.reconcile_now().await.unwrap();
    assert!(again.policy.unwrap().killed.is_empty());
    assert!(target_of(&server, meter).is_some());
}

#[tokio::test]
async fn test_reloaded_rules_are_enforced_at_once() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    let reconciler = reconciler_for(server.clone(), &config());
    reconciler.reconcile_now().await.unwrap();
    let renderer = server.open_stream("ndi-display", None, StreamDirection::Playback, HDMI_0);
    let player = server.open_stream("vlc", Some("vlc"), StreamDirection::Playback, HDMI_1);

    // The operator moves the display to the second port and admits vlc there
    let mut reloaded = config();
    reloaded.policy.display_hdmi_output = 1;
    reloaded.policy.rules.push(AccessRule {
        name: "media-player".to_string(),
        applications: vec![AppMatcher::new("vlc")],
        allowed_devices: vec![DeviceRef::Named(HDMI_1.to_string())],
    });
    reloaded.validate().unwrap();

    let snapshot = reconciler.snapshot().await.unwrap();
    let inventory = reconciler.inventory(&snapshot);
    let report = reconciler
        .policy()
        .apply_rules(reloaded.policy.effective_rules(), &inventory)
        .await
        .unwrap();

    assert!(report.document_changed);
    assert!(report.killed.is_empty());
    assert_eq!(report.moved.len(), 1);
    assert_eq!(target_of(&server, renderer).as_deref(), Some(HDMI_1));
    assert_eq!(target_of(&server, player).as_deref(), Some(HDMI_1));
    assert_eq!(server.policy_writes(), 2);
}

// ============================================================================
// POLICY DOCUMENT AND AUDIT
// ============================================================================

#[tokio::test]
async fn test_policy_document_written_once() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    let reconciler = reconciler_for(server.clone(), &config());

    for _ in 0..3 {
        reconciler.reconcile_now().await.unwrap();
    }
    assert_eq!(server.policy_writes(), 1);

    let document = server.policy().unwrap();
    assert!(document
        .content
        .contains("media.allowed-targets = \"intercom-microphone,intercom-speaker\""));
    assert!(document.content.contains(HDMI_0));
    assert!(!document.content.contains(HDMI_1));

    // The headset appearing changes nothing for the rules
    server.plug_headset();
    reconciler.reconcile_now().await.unwrap();
    assert_eq!(server.policy_writes(), 1);
}

#[tokio::test]
async fn test_audit_reports_then_reconcile_clears() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();
    let reconciler = reconciler_for(server.clone(), &config());
    reconciler.reconcile_now().await.unwrap();

    server.open_stream("chrome", Some("chrome"), StreamDirection::Playback, server.headset_output());
    let snapshot = reconciler.snapshot().await.unwrap();
    let inventory = reconciler.inventory(&snapshot);

    let violations = reconciler.policy().audit(&inventory).await.unwrap();
    assert_eq!(
        violations,
        vec![AudioError::PolicyViolationDetected {
            application: "chrome".to_string(),
            device: server.headset_output().to_string(),
        }]
    );

    reconciler.reconcile_now().await.unwrap();
    assert!(reconciler.policy().audit(&inventory).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enumeration_view_per_application() {
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();
    let reconciler = reconciler_for(server.clone(), &config());
    reconciler.reconcile_now().await.unwrap();

    let snapshot = reconciler.snapshot().await.unwrap();
    let resolved = reconciler.policy().resolve(&reconciler.inventory(&snapshot));

    let mut chrome = IsolationPolicyEngine::enumerate(&resolved, "chrome", &snapshot.nodes);
    chrome.sort();
    assert_eq!(chrome, vec!["intercom-microphone", "intercom-speaker"]);

    let display = IsolationPolicyEngine::enumerate(&resolved, "ndi-display", &snapshot.nodes);
    assert!(display.iter().any(|n| n == HDMI_0));
    assert!(!display.iter().any(|n| n == HDMI_1));

    assert_eq!(
        IsolationPolicyEngine::check(&resolved, "chrome", server.headset_output()),
        Decision::Deny
    );
    assert_eq!(
        IsolationPolicyEngine::check(&resolved, "vlc", HDMI_0),
        Decision::Deny
    );
}
