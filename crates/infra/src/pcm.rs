//! Network-audio PCM preconditions
//!
//! The PCM plugin reads its clock from the socket published by the clock
//! bridge. Opening it without that socket only yields an opaque ALSA error
//! later, so [`NetworkPcm::open`] refuses up front.

use bridge_audio_core::domain::audio::{AudioError, Result};
use bridge_audio_core::domain::clock::{check_clock_socket, AlsaPcmStanza};
use std::path::Path;
use tracing::info;

/// A network-audio PCM whose preconditions hold
#[derive(Debug, Clone)]
pub struct NetworkPcm {
    stanza: AlsaPcmStanza,
}

impl NetworkPcm {
    /// Check the clock socket, then the declared stanza
    pub async fn open(clock_socket: &Path, asound_conf: &Path, pcm_name: &str) -> Result<Self> {
        check_clock_socket(clock_socket)?;

        let config = tokio::fs::read_to_string(asound_conf).await.map_err(|e| {
            AudioError::InvalidConfiguration(format!("{}: {}", asound_conf.display(), e))
        })?;
        let stanza = AlsaPcmStanza::parse(&config, pcm_name)
            .and_then(|stanza| stanza.validate().map(|_| stanza))
            .map_err(|e| AudioError::InvalidConfiguration(e.to_string()))?;
        if stanza.clock_path != clock_socket {
            return Err(AudioError::InvalidConfiguration(format!(
                "pcm.{} reads its clock from {}, not {}",
                pcm_name,
                stanza.clock_path.display(),
                clock_socket.display()
            )));
        }

        info!(pcm = pcm_name, "Network PCM ready");
        Ok(Self { stanza })
    }

    /// ALSA device name to hand to the consumer
    pub fn device(&self) -> &str {
        &self.stanza.pcm_name
    }

    pub fn stanza(&self) -> &AlsaPcmStanza {
        &self.stanza
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;
    use tempfile::TempDir;

    fn write_conf(dir: &TempDir, stanza: &AlsaPcmStanza) -> std::path::PathBuf {
        let path = dir.path().join("asound.conf");
        std::fs::write(&path, format!("# generated\n{}", stanza.render())).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_socket_is_clock_unavailable() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("ptp-usrvclock");
        let conf = write_conf(
            &dir,
            &AlsaPcmStanza {
                clock_path: socket.clone(),
                ..Default::default()
            },
        );

        let err = NetworkPcm::open(&socket, &conf, "dante").await.unwrap_err();
        assert_eq!(
            err,
            AudioError::ClockUnavailable {
                path: socket.display().to_string()
            }
        );

        // A regular file is not a socket either
        std::fs::write(&socket, b"").unwrap();
        assert!(matches!(
            NetworkPcm::open(&socket, &conf, "dante").await,
            Err(AudioError::ClockUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_with_socket() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("ptp-usrvclock");
        let _bound = UnixDatagram::bind(&socket).unwrap();
        let conf = write_conf(
            &dir,
            &AlsaPcmStanza {
                clock_path: socket.clone(),
                ..Default::default()
            },
        );

        let pcm = NetworkPcm::open(&socket, &conf, "dante").await.unwrap();
        assert_eq!(pcm.device(), "dante");
        assert_eq!(pcm.stanza().sample_rate, 96000);
    }

    #[tokio::test]
    async fn test_plug_wrapper_rejected() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("ptp-usrvclock");
        let _bound = UnixDatagram::bind(&socket).unwrap();
        let conf = write_conf(
            &dir,
            &AlsaPcmStanza {
                plugin_type: "plug".to_string(),
                clock_path: socket.clone(),
                ..Default::default()
            },
        );

        assert!(matches!(
            NetworkPcm::open(&socket, &conf, "dante").await,
            Err(AudioError::InvalidConfiguration(_))
        ));
    }
}
