//! Live event relay between connected editors
//!
//! Fire-and-forget fan-out: an event published by one session reaches
//! every *other* session currently subscribed. Delivery is best effort.
//! There is no replay, a session that connects late or lags behind simply
//! misses events. Events from one sender arrive in send order.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Default number of in-flight events before slow receivers start skipping
pub const DEFAULT_CAPACITY: usize = 256;

/// Events the relay carries. Payloads are opaque to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// Console line
    Log(String),
    /// Rendered HTML for the preview pane
    PreviewUpdate(String),
    /// Base64 frame from a GUI stream
    GuiFrame(String),
}

impl RelayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::Log(_) => "log",
            RelayEvent::PreviewUpdate(_) => "preview-update",
            RelayEvent::GuiFrame(_) => "gui-frame",
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    from: Uuid,
    event: RelayEvent,
}

/// The shared topic. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BroadcastRelay {
    tx: broadcast::Sender<Envelope>,
}

impl Default for BroadcastRelay {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BroadcastRelay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new session. Only events published after this call are seen.
    pub fn join(&self) -> Session {
        Session {
            id: Uuid::new_v4(),
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One connected editor's view of the relay
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    tx: broadcast::Sender<Envelope>,
    rx: broadcast::Receiver<Envelope>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Never blocks. Returns how many other sessions were listening.
    pub fn publish(&self, event: RelayEvent) -> usize {
        let envelope = Envelope {
            from: self.id,
            event,
        };
        match self.tx.send(envelope) {
            // Our own receiver is counted too
            Ok(receivers) => receivers.saturating_sub(1),
            Err(_) => 0,
        }
    }

    /// Next event from another session. `None` once the relay is gone.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.from == self.id => continue,
                Ok(envelope) => return Some(envelope.event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %self.id, skipped, "relay receiver lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
