//! Invocation of the `pactl` and `parec` tools
//!
//! Both talk to PipeWire's pulse server of the session they inherit through
//! `XDG_RUNTIME_DIR` or `PULSE_SERVER`. Children are killed when the caller's
//! future is dropped, so a timed-out call leaves no process behind.

use bridge_audio_core::domain::audio::{AudioError, Result, METER_CLIENT};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, trace};

/// Markers of a pulse server that is not there
const UNREACHABLE: [&str; 3] = ["Connection refused", "Connection failure", "Access denied"];

#[derive(Debug, Clone)]
pub struct Pactl {
    pactl: PathBuf,
    parec: PathBuf,
    runtime_dir: Option<PathBuf>,
}

impl Default for Pactl {
    fn default() -> Self {
        Self {
            pactl: PathBuf::from("pactl"),
            parec: PathBuf::from("parec"),
            runtime_dir: None,
        }
    }
}

impl Pactl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use other binaries (tests, non-standard installs)
    pub fn with_programs(pactl: impl Into<PathBuf>, parec: impl Into<PathBuf>) -> Self {
        Self {
            pactl: pactl.into(),
            parec: parec.into(),
            runtime_dir: None,
        }
    }

    /// Reach the session server of another user
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    fn command(&self, program: &Path) -> Command {
        let mut command = Command::new(program);
        if let Some(dir) = &self.runtime_dir {
            command.env("XDG_RUNTIME_DIR", dir);
        }
        command.kill_on_drop(true);
        command
    }

    /// Run pactl and return its stdout
    pub async fn run(&self, args: &[String]) -> Result<String> {
        trace!(?args, "pactl");
        let output = self
            .command(&self.pactl)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                AudioError::backend_unavailable(format!(
                    "cannot run {}: {}",
                    self.pactl.display(),
                    e
                ))
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(?args, %stderr, "pactl failed");
        if UNREACHABLE.iter().any(|m| stderr.contains(m)) {
            return Err(AudioError::backend_unavailable(stderr));
        }
        Err(AudioError::CommandFailed(format!(
            "pactl {}: {}",
            args.join(" "),
            stderr
        )))
    }

    /// `pactl --format=json list <what>`
    pub async fn list(&self, what: &str) -> Result<String> {
        self.run(&["--format=json".to_string(), "list".to_string(), what.to_string()])
            .await
    }

    /// `pactl load-module`, returning the module index
    pub async fn load_module(&self, module: &str, args: Vec<String>) -> Result<u32> {
        let mut argv = vec!["load-module".to_string(), module.to_string()];
        argv.extend(args);
        let out = self.run(&argv).await?;
        out.trim()
            .parse()
            .map_err(|_| AudioError::Parse(format!("load-module {} printed {:?}", module, out.trim())))
    }

    pub async fn unload_module(&self, module_id: u32) -> Result<()> {
        self.run(&["unload-module".to_string(), module_id.to_string()])
            .await
            .map(|_| ())
    }

    /// Start `pactl subscribe`, with its event lines on stdout
    pub fn subscribe(&self) -> Result<Child> {
        self.command(&self.pactl)
            .arg("subscribe")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AudioError::backend_unavailable(format!(
                    "cannot run {}: {}",
                    self.pactl.display(),
                    e
                ))
            })
    }

    /// Capture `bytes` of mono s16le audio from a capture endpoint
    pub async fn record(&self, device: &str, bytes: usize) -> Result<Vec<u8>> {
        let mut child = self
            .command(&self.parec)
            .arg(format!("--device={}", device))
            .arg(format!("--client-name={}", METER_CLIENT))
            .args(["--raw", "--channels=1", "--format=s16le", "--rate=8000"])
            .arg("--latency-msec=20")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AudioError::backend_unavailable(format!(
                    "cannot run {}: {}",
                    self.parec.display(),
                    e
                ))
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AudioError::CommandFailed("parec has no stdout".to_string()))?;
        let mut buf = vec![0u8; bytes];
        let mut filled = 0;
        while filled < bytes {
            let n = stdout
                .read(&mut buf[filled..])
                .await
                .map_err(|e| AudioError::CommandFailed(format!("parec read: {}", e)))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        let _ = child.kill().await;
        Ok(buf)
    }
}

/// Peak of s16le frames, 0.0 to 1.0
pub fn s16le_peak(frames: &[u8]) -> f32 {
    frames
        .chunks_exact(2)
        .map(|b| (i16::from_le_bytes([b[0], b[1]]) as i32).unsigned_abs())
        .max()
        .map(|peak| (peak as f32 / 32768.0).min(1.0))
        .unwrap_or(0.0)
}
