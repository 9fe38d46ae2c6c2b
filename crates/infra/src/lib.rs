//! Live-system adapters for the media bridge audio manager
//!
//! - [`pactl`]: the PipeWire backend behind the core `AudioServer` trait
//! - [`lock`]: cross-process reconcile lock
//! - [`hotplug`]: audio-server events as reconcile triggers
//! - [`ptp`]: PTP daemon log follower driving the clock bridge
//! - [`pcm`]: network-audio PCM preconditions
//! - [`state`]: runtime state and saved defaults on disk

pub mod hotplug;
pub mod lock;
pub mod pactl;
pub mod pcm;
pub mod ptp;
pub mod state;

pub use hotplug::HotplugWatcher;
pub use lock::{LockError, ReconcileLock};
pub use pactl::{Pactl, PactlAudioServer};
pub use pcm::NetworkPcm;
pub use ptp::{PtpError, PtpFollower};
pub use state::{JsonFile, RuntimeState, SavedDefaults, StateError, StateStore};
