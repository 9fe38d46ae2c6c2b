//! Audio-server event subscription
//!
//! Follows `pactl subscribe` and fires the reconcile trigger when a card,
//! sink or source appears or disappears, or when a client opens a stream.

use crate::pactl::Pactl;
use bridge_audio_core::domain::reconciler::ReconcileTrigger;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Change,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    Card,
    Sink,
    Source,
    SinkInput,
    SourceOutput,
    Module,
    Client,
    Server,
}

/// One `Event '<kind>' on <facility> #<index>` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEvent {
    pub kind: EventKind,
    pub facility: Facility,
    pub index: Option<u32>,
}

impl ServerEvent {
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix("Event '")?;
        let (kind, rest) = rest.split_once('\'')?;
        let kind = match kind {
            "new" => EventKind::New,
            "change" => EventKind::Change,
            "remove" => EventKind::Remove,
            _ => return None,
        };
        let rest = rest.trim().strip_prefix("on ")?;
        let (facility, index) = match rest.split_once(" #") {
            Some((facility, index)) => (facility, index.trim().parse().ok()),
            None => (rest.trim(), None),
        };
        let facility = match facility {
            "card" => Facility::Card,
            "sink" => Facility::Sink,
            "source" => Facility::Source,
            "sink-input" => Facility::SinkInput,
            "source-output" => Facility::SourceOutput,
            "module" => Facility::Module,
            "client" => Facility::Client,
            "server" => Facility::Server,
            _ => return None,
        };
        Some(Self {
            kind,
            facility,
            index,
        })
    }

    /// Topology changes and new client streams
    pub fn triggers_reconcile(&self) -> bool {
        match (self.kind, self.facility) {
            (EventKind::New | EventKind::Remove, Facility::Sink | Facility::Source) => true,
            (_, Facility::Card) => true,
            (EventKind::New, Facility::SinkInput | Facility::SourceOutput) => true,
            _ => false,
        }
    }
}

/// Fire `trigger` for every relevant line until the stream ends
pub async fn forward_events<R>(lines: R, trigger: &ReconcileTrigger) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut fired = 0;
    let mut lines = lines.lines();
    while let Some(line) = lines.next_line().await? {
        match ServerEvent::parse(&line) {
            Some(event) if event.triggers_reconcile() => {
                debug!(?event, "Audio server event");
                trigger.fire();
                fired += 1;
            }
            _ => {}
        }
    }
    Ok(fired)
}

pub struct HotplugWatcher {
    pactl: Pactl,
    restart_delay: Duration,
}

impl HotplugWatcher {
    pub fn new(pactl: Pactl) -> Self {
        Self {
            pactl,
            restart_delay: Duration::from_secs(2),
        }
    }

    /// Subscribe forever, restarting the subscriber when it exits
    pub fn spawn(self, trigger: ReconcileTrigger) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.pactl.subscribe() {
                    Ok(mut child) => {
                        info!("Subscribed to audio server events");
                        if let Some(stdout) = child.stdout.take() {
                            if let Err(e) = forward_events(BufReader::new(stdout), &trigger).await {
                                warn!(error = %e, "Reading audio server events failed");
                            }
                        }
                        let _ = child.kill().await;
                        // The server may have restarted; resync with it
                        trigger.fire();
                    }
                    Err(e) => warn!(error = %e, "Cannot subscribe to audio server events"),
                }
                tokio::time::sleep(self.restart_delay).await;
            }
        })
    }
}
