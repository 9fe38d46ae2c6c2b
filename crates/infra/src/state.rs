//! Persisted runtime state and saved intercom defaults
//!
//! Both are small JSON files replaced atomically. The runtime state carries
//! desired state that is not in the config file (self-monitoring on or off);
//! the defaults file is what `save-defaults` captured.

use bridge_audio_core::domain::graph::EndpointState;
use bridge_audio_core::domain::reconciler::AudioManagerReconciler;
use bridge_audio_core::domain::status::Status;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Desired state changed at runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub monitor_enabled: bool,
}

/// What `save-defaults` writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDefaults {
    pub input: EndpointState,
    pub output: EndpointState,
    #[serde(default)]
    pub monitor_enabled: bool,
}

impl SavedDefaults {
    pub fn new(status: Status, monitor_enabled: bool) -> Self {
        Self {
            input: status.input,
            output: status.output,
            monitor_enabled,
        }
    }

    pub fn status(&self) -> Status {
        Status {
            input: self.input,
            output: self.output,
        }
    }
}

/// A JSON document at a fixed path
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when the file does not exist
    pub async fn read<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StateError::Json {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn write<T: Serialize>(&self, value: &T) -> Result<bool> {
        let mut json = serde_json::to_string_pretty(value).map_err(|source| StateError::Json {
            path: self.path.clone(),
            source,
        })?;
        json.push('\n');
        write_if_changed(&self.path, &json)
            .await
            .map_err(|source| StateError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Runtime state with a forgiving load
#[derive(Debug, Clone)]
pub struct StateStore {
    file: JsonFile,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    /// Missing or unreadable state falls back to the default
    pub async fn load(&self) -> RuntimeState {
        match self.file.read().await {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!(path = %self.file.path().display(), "No runtime state yet");
                RuntimeState::default()
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable runtime state");
                RuntimeState::default()
            }
        }
    }

    pub async fn save(&self, state: &RuntimeState) -> Result<()> {
        self.file.write(state).await.map(|_| ())
    }

    /// Bring a long-lived reconciler up to date with what other processes
    /// persisted, such as a `monitor enable` from the CLI
    pub async fn refresh(&self, reconciler: &AudioManagerReconciler) -> RuntimeState {
        let state = self.load().await;
        if reconciler.monitor_enabled() != state.monitor_enabled {
            info!(enabled = state.monitor_enabled, "Self-monitoring changed on disk");
            reconciler.set_monitor_enabled(state.monitor_enabled);
        }
        state
    }
}

/// Atomically replace `path` unless it already holds `content`
pub async fn write_if_changed(path: &Path, content: &str) -> std::io::Result<bool> {
    if let Ok(existing) = fs::read_to_string(path).await {
        if existing == content {
            debug!(path = %path.display(), "Unchanged, not rewriting");
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    info!(path = %path.display(), "Installed file");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_written_only_on_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wireplumber.conf.d").join("60-access.conf");

        assert!(write_if_changed(&path, "access.rules = []\n").await.unwrap());
        assert!(!write_if_changed(&path, "access.rules = []\n").await.unwrap());
        assert!(write_if_changed(&path, "access.rules = [ x ]\n").await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "access.rules = [ x ]\n");
        assert!(!dir.path().join("wireplumber.conf.d").join("60-access.conf.tmp").exists());
    }

    #[tokio::test]
    async fn test_runtime_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().await, RuntimeState::default());

        store.save(&RuntimeState { monitor_enabled: true }).await.unwrap();
        assert!(store.load().await.monitor_enabled);

        std::fs::write(dir.path().join("state.json"), "{oops").unwrap();
        assert_eq!(store.load().await, RuntimeState::default());
    }

    #[tokio::test]
    async fn test_refresh_follows_file() {
        use bridge_audio_core::domain::memory::InMemoryAudioServer;
        use bridge_audio_core::domain::policy::AccessRule;
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let reconciler = AudioManagerReconciler::new(
            Arc::new(InMemoryAudioServer::appliance()),
            Default::default(),
            AccessRule::builtin(0),
        )
        .unwrap();

        assert!(!store.refresh(&reconciler).await.monitor_enabled);
        assert!(!reconciler.monitor_enabled());

        store.save(&RuntimeState { monitor_enabled: true }).await.unwrap();
        assert!(store.refresh(&reconciler).await.monitor_enabled);
        assert!(reconciler.monitor_enabled());

        store.save(&RuntimeState { monitor_enabled: false }).await.unwrap();
        store.refresh(&reconciler).await;
        assert!(!reconciler.monitor_enabled());
    }

    #[tokio::test]
    async fn test_defaults_file_shape() {
        let dir = TempDir::new().unwrap();
        let file = JsonFile::new(dir.path().join("intercom.json"));
        assert!(file.read::<SavedDefaults>().await.unwrap().is_none());

        let defaults = SavedDefaults::new(
            Status {
                input: EndpointState { volume: 70, muted: false },
                output: EndpointState { volume: 55, muted: true },
            },
            true,
        );
        file.write(&defaults).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(json["output"]["muted"], true);
        assert_eq!(json["monitor_enabled"], true);
        assert_eq!(file.read::<SavedDefaults>().await.unwrap(), Some(defaults));
    }
}
