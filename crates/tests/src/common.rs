//! Shared fixtures

use bridge_audio_core::domain::config::BridgeAudioConfig;
use bridge_audio_core::domain::memory::InMemoryAudioServer;
use bridge_audio_core::domain::AudioManagerReconciler;
use std::sync::Arc;
use std::time::Duration;

pub const HDMI_0: &str = "alsa_output.pci-0000_00_1f.3.hdmi-stereo";
pub const HDMI_1: &str = "alsa_output.pci-0000_00_1f.3.hdmi-stereo-extra1";

/// Factory configuration with test-friendly timing
pub fn config() -> BridgeAudioConfig {
    let mut config = BridgeAudioConfig::factory_default();
    config.app.call_timeout_ms = 200;
    config.app.debounce_ms = 0;
    config
}

pub fn reconciler_for(
    server: Arc<InMemoryAudioServer>,
    config: &BridgeAudioConfig,
) -> AudioManagerReconciler {
    AudioManagerReconciler::new(
        server,
        config.reconciler_settings(),
        config.policy.effective_rules(),
    )
    .unwrap()
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
