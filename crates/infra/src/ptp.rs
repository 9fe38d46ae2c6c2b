//! PTP daemon log follower
//!
//! The PTP daemon reports port state changes and its timestamping mode in
//! its journal. Following that journal drives [`ClockSyncBridge`], which
//! publishes the clock socket once the follower locks.

use bridge_audio_core::domain::clock::{ClockError, ClockState, ClockSyncBridge};
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum PtpError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error("cannot follow the journal of {unit}: {source}")]
    Follow {
        unit: String,
        source: std::io::Error,
    },

    #[error("journal of {unit} ended")]
    Ended { unit: String },
}

/// Feed log lines to the bridge, publishing every state it reaches
///
/// Returns when the lines run out; a `MASTER` observation aborts with
/// [`ClockError::MasterObserved`].
pub async fn drive<R>(
    bridge: &mut ClockSyncBridge,
    lines: R,
    states: &watch::Sender<ClockState>,
) -> Result<(), PtpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = lines.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(source) => {
                return Err(PtpError::Follow {
                    unit: "log stream".to_string(),
                    source,
                })
            }
        };
        match bridge.handle_line(&line) {
            Ok(Some(state)) => {
                states.send_if_modified(|current| {
                    let changed = *current != state;
                    *current = state;
                    changed
                });
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, %line, "Clock misconfiguration");
                return Err(e.into());
            }
        }
    }
}

/// Follows the journal of the PTP daemon unit
pub struct PtpFollower {
    unit: String,
    journalctl: PathBuf,
}

impl PtpFollower {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            journalctl: PathBuf::from("journalctl"),
        }
    }

    pub fn with_program(mut self, journalctl: impl Into<PathBuf>) -> Self {
        self.journalctl = journalctl.into();
        self
    }

    /// Follow until the journal ends or the daemon turns master
    pub async fn follow(
        &self,
        bridge: &mut ClockSyncBridge,
        states: &watch::Sender<ClockState>,
    ) -> Result<(), PtpError> {
        let mut child = Command::new(&self.journalctl)
            // Recent lines first so the current state is known at once
            .args(["--follow", "--output=cat", "--lines=100", "--unit"])
            .arg(&self.unit)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PtpError::Follow {
                unit: self.unit.clone(),
                source,
            })?;
        info!(unit = %self.unit, "Following PTP daemon");

        let stdout = child.stdout.take().ok_or_else(|| PtpError::Ended {
            unit: self.unit.clone(),
        })?;
        drive(bridge, BufReader::new(stdout), states).await?;
        let _ = child.kill().await;
        Err(PtpError::Ended {
            unit: self.unit.clone(),
        })
    }
}
