//! Domain entities and business rules

pub mod audio;
pub mod clock;
pub mod config;
pub mod control;
pub mod graph;
pub mod memory;
pub mod policy;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod status;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioError, ChannelCount, DeviceKind, HardwareBinding, HardwareDevice, HardwareIdentity,
    HardwareRole, SampleRate, VirtualDevice, INTERCOM_MICROPHONE, INTERCOM_SPEAKER, METER_CLIENT,
};
pub use clock::{
    check_clock_socket, AlsaPcmStanza, ClockDomain, ClockError, ClockState, ClockSyncBridge,
    PtpEvent, PtpRole, TimestampingMode, DEFAULT_CLOCK_SOCKET,
};
pub use config::{BridgeAudioConfig, ConfigError, ConfigManager, ConfigWatcher};
pub use control::{Endpoint, MuteAction, VolumeControl};
pub use graph::{AudioServer, GraphSnapshot, LinkKey, LoopbackInfo, NodeInfo, StreamInfo};
pub use memory::InMemoryAudioServer;
pub use policy::{
    AccessRule, AppMatcher, Decision, DeviceRef, IsolationPolicyEngine, PolicyDocument, PolicyReport,
};
pub use reconciler::{
    AudioManagerReconciler, ChangeAction, Inconsistency, ReconcileResult, ReconcileTrigger,
    ReconcilerSettings,
};
pub use registry::{EnsureOutcome, VirtualDeviceRegistry};
pub use router::{LinkOptions, LinkRole, LoopbackLink, LoopbackRouter};
pub use status::{AudioLevel, LevelMeter, LevelSnapshot, MeterReading, Status, StatusReporter};
