//! Status reporting and level metering
//!
//! Both are read-only projections of the live audio server. Nothing here is
//! cached between calls or fed back into the reconciler.

use crate::domain::audio::{DeviceKind, Result, VirtualDevice};
use crate::domain::graph::{with_timeout, AudioServer, EndpointState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

/// `{"input": {...}, "output": {...}}` as consumed by the web control layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub input: EndpointState,
    pub output: EndpointState,
}

/// Reads volume and mute of the intercom endpoints
pub struct StatusReporter {
    server: Arc<dyn AudioServer>,
    call_timeout: Duration,
    speaker: String,
    microphone: String,
}

impl StatusReporter {
    pub fn new(
        server: Arc<dyn AudioServer>,
        call_timeout: Duration,
        speaker: &VirtualDevice,
        microphone: &VirtualDevice,
    ) -> Self {
        Self {
            server,
            call_timeout,
            speaker: speaker.name.clone(),
            microphone: microphone.name.clone(),
        }
    }

    #[instrument(skip(self))]
    pub async fn status(&self) -> Result<Status> {
        let input = with_timeout(
            self.call_timeout,
            "read input state",
            self.server.endpoint_state(&self.microphone, DeviceKind::Source),
        )
        .await?;
        let output = with_timeout(
            self.call_timeout,
            "read output state",
            self.server.endpoint_state(&self.speaker, DeviceKind::Sink),
        )
        .await?;
        Ok(Status { input, output })
    }
}

/// Level in decibels with a decaying peak hold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioLevel {
    pub current_db: f32,
    pub peak_db: f32,
}

impl AudioLevel {
    pub const MIN_LEVEL: f32 = -60.0;
    pub const MAX_LEVEL: f32 = 0.0;

    pub fn new() -> Self {
        Self {
            current_db: Self::MIN_LEVEL,
            peak_db: Self::MIN_LEVEL,
        }
    }

    /// Update with a linear sample peak (0.0 to 1.0)
    pub fn update(&mut self, sample: f32) {
        let level = if sample.abs() > 0.0 {
            let db = 20.0 * sample.abs().log10();
            db.clamp(Self::MIN_LEVEL, Self::MAX_LEVEL)
        } else {
            Self::MIN_LEVEL
        };

        self.current_db = level;
        self.peak_db = self.peak_db.max(level);
    }

    /// Decay peak level (call once per tick)
    pub fn decay_peak(&mut self, amount: f32) {
        self.peak_db = (self.peak_db - amount).max(self.current_db).max(Self::MIN_LEVEL);
    }

    fn percent(db: f32) -> u8 {
        let span = Self::MAX_LEVEL - Self::MIN_LEVEL;
        (((db - Self::MIN_LEVEL) / span) * 100.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn reading(&self) -> MeterReading {
        MeterReading {
            level: Self::percent(self.current_db),
            peak: Self::percent(self.peak_db),
        }
    }
}

impl Default for AudioLevel {
    fn default() -> Self {
        Self::new()
    }
}

/// VU-style reading, 0-100
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MeterReading {
    pub level: u8,
    pub peak: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelSnapshot {
    pub input: MeterReading,
    pub output: MeterReading,
}

/// Samples intercom peak levels at a fixed low rate
pub struct LevelMeter {
    server: Arc<dyn AudioServer>,
    call_timeout: Duration,
    rate_hz: u32,
    /// Peak decay in dB per second
    decay_rate: f32,
    speaker: String,
    microphone: String,
    levels: [AudioLevel; 2],
}

impl LevelMeter {
    pub fn new(
        server: Arc<dyn AudioServer>,
        call_timeout: Duration,
        rate_hz: u32,
        decay_rate: f32,
        speaker: &VirtualDevice,
        microphone: &VirtualDevice,
    ) -> Self {
        Self {
            server,
            call_timeout,
            rate_hz: rate_hz.max(1),
            decay_rate,
            speaker: speaker.name.clone(),
            microphone: microphone.name.clone(),
            levels: [AudioLevel::new(); 2],
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate_hz))
    }

    async fn peak(&self, name: &str, kind: DeviceKind) -> f32 {
        match with_timeout(self.call_timeout, "read peak", self.server.peak_level(name, kind)).await {
            Ok(peak) => peak,
            Err(e) => {
                debug!(device = name, error = %e, "Peak read failed, metering silence");
                0.0
            }
        }
    }

    /// Take one reading
    pub async fn tick(&mut self) -> LevelSnapshot {
        let (input, output) = tokio::join!(
            self.peak(&self.microphone, DeviceKind::Source),
            self.peak(&self.speaker, DeviceKind::Sink),
        );
        let decay = self.decay_rate / self.rate_hz as f32;

        for (level, sample) in self.levels.iter_mut().zip([input, output]) {
            level.decay_peak(decay);
            level.update(sample);
        }
        LevelSnapshot {
            input: self.levels[0].reading(),
            output: self.levels[1].reading(),
        }
    }

    /// Publish readings until every receiver is gone
    pub fn spawn(mut self) -> (watch::Receiver<LevelSnapshot>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(LevelSnapshot::default());
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let snapshot = self.tick().await;
                if tx.send(snapshot).is_err() {
                    debug!("Level meter has no listeners, stopping");
                    break;
                }
            }
        });
        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::AudioError;
    use crate::domain::memory::InMemoryAudioServer;

    async fn server_with_devices() -> Arc<InMemoryAudioServer> {
        let server = Arc::new(InMemoryAudioServer::new());
        server
            .create_virtual_device(&VirtualDevice::intercom_speaker())
            .await
            .unwrap();
        server
            .create_virtual_device(&VirtualDevice::intercom_microphone())
            .await
            .unwrap();
        server
    }

    fn reporter(server: Arc<InMemoryAudioServer>) -> StatusReporter {
        StatusReporter::new(
            server,
            Duration::from_secs(1),
            &VirtualDevice::intercom_speaker(),
            &VirtualDevice::intercom_microphone(),
        )
    }

    #[tokio::test]
    async fn test_status_json_shape() {
        let server = server_with_devices().await;
        server
            .set_volume("intercom-microphone", DeviceKind::Source, 65)
            .await
            .unwrap();
        server
            .set_mute("intercom-speaker", DeviceKind::Sink, true)
            .await
            .unwrap();

        let status = reporter(server).status().await.unwrap();
        let json = serde_json::to_value(status).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "input": {"volume": 65, "muted": false},
                "output": {"volume": 100, "muted": true}
            })
        );
    }

    #[tokio::test]
    async fn test_status_without_devices() {
        let server = Arc::new(InMemoryAudioServer::new());
        let err = reporter(server).status().await.unwrap_err();
        assert!(matches!(err, AudioError::DeviceNotFound(_)));
    }

    #[test]
    fn test_level_update() {
        let mut level = AudioLevel::new();
        level.update(1.0);
        assert_eq!(level.reading(), MeterReading { level: 100, peak: 100 });

        level.update(0.0);
        assert_eq!(level.reading().level, 0);
        assert_eq!(level.reading().peak, 100);

        level.decay_peak(30.0);
        assert_eq!(level.reading().peak, 50);
        level.decay_peak(100.0);
        assert_eq!(level.reading().peak, 0);
    }

    #[tokio::test]
    async fn test_meter_tick() {
        let server = server_with_devices().await;
        server.set_peak("intercom-microphone", 0.1);
        let mut meter = LevelMeter::new(
            server.clone(),
            Duration::from_secs(1),
            10,
            12.0,
            &VirtualDevice::intercom_speaker(),
            &VirtualDevice::intercom_microphone(),
        );
        assert_eq!(meter.period(), Duration::from_millis(100));

        let snapshot = meter.tick().await;
        // 0.1 is -20 dB
        assert_eq!(snapshot.input.level, 67);
        assert_eq!(snapshot.output.level, 0);

        server.set_peak("intercom-microphone", 0.0);
        let snapshot = meter.tick().await;
        assert_eq!(snapshot.input.level, 0);
        assert!(snapshot.input.peak > 60);
    }

    #[tokio::test]
    async fn test_meter_reads_both_devices_at_once() {
        let server = server_with_devices().await;
        server.set_peak("intercom-microphone", 1.0);
        server.set_peak("intercom-speaker", 1.0);
        server.set_delay(Some(Duration::from_millis(200)));
        let mut meter = LevelMeter::new(
            server.clone(),
            Duration::from_secs(1),
            10,
            12.0,
            &VirtualDevice::intercom_speaker(),
            &VirtualDevice::intercom_microphone(),
        );

        let started = std::time::Instant::now();
        let snapshot = meter.tick().await;
        assert!(started.elapsed() < Duration::from_millis(380));
        assert_eq!(snapshot.input.level, 100);
        assert_eq!(snapshot.output.level, 100);
    }

    #[tokio::test]
    async fn test_meter_publishes() {
        let server = server_with_devices().await;
        server.set_peak("intercom-speaker", 1.0);
        let meter = LevelMeter::new(
            server,
            Duration::from_secs(1),
            50,
            12.0,
            &VirtualDevice::intercom_speaker(),
            &VirtualDevice::intercom_microphone(),
        );

        let (mut rx, handle) = meter.spawn();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().output.level, 100);

        drop(rx);
        handle.await.unwrap();
    }
}
