//! Example walking through configuration and a dry reconcile
//!
//! Run with: cargo run --package bridge-audio-core --example config_demo

use bridge_audio_core::domain::{
    AudioManagerReconciler, BridgeAudioConfig, ConfigManager, InMemoryAudioServer,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("bridge_audio_core=debug,info")
        .init();

    println!("=== Media Bridge Audio Configuration Demo ===\n");

    // 1. Load (or create) a configuration file
    let dir = std::env::temp_dir().join("bridge-audio-demo");
    let manager = ConfigManager::new(dir.join("audio.toml"));
    let config = manager.load().await;
    config.validate()?;
    println!("1. Configuration at {}", manager.config_path().display());
    println!(
        "   intercom: {} / {}",
        config.intercom.speaker.name, config.intercom.microphone.name
    );
    println!("   policy rules: {}", config.policy.effective_rules().len());

    // 2. Reconcile an in-memory appliance with the headset attached
    let server = Arc::new(InMemoryAudioServer::appliance());
    server.plug_headset();
    let reconciler = AudioManagerReconciler::new(
        server.clone(),
        config.reconciler_settings(),
        config.policy.effective_rules(),
    )?;
    let result = reconciler.reconcile_now().await?;
    println!("\n2. Reconcile result:");
    println!("{}", serde_json::to_string_pretty(&result)?);

    // 3. A second run changes nothing
    let again = reconciler.reconcile_now().await?;
    println!("\n3. Second run clean: {}", again.is_clean());

    // 4. Render the default file
    println!("\n4. Factory default file:\n");
    println!("{}", toml::to_string_pretty(&BridgeAudioConfig::factory_default())?);

    Ok(())
}
