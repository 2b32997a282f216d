//! Push channel between the orchestrator and whoever consumes events.
//!
//! The emitter is a bounded `mpsc` sender. `emit` waits for capacity, so a
//! slow consumer slows the run down instead of growing a buffer, and it
//! fails with [`AnalysisError::StreamTransport`] once the receiver is gone.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use parley_core::{AnalysisError, AnalysisEvent, Result};

/// Default number of events buffered between producer and transport.
pub const DEFAULT_CAPACITY: usize = 32;

#[derive(Clone)]
pub struct StreamEmitter {
    tx: mpsc::Sender<AnalysisEvent>,
}

/// Create a connected emitter and receiving end.
pub fn channel(capacity: usize) -> (StreamEmitter, mpsc::Receiver<AnalysisEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamEmitter { tx }, rx)
}

/// Like [`channel`], with the receiver wrapped as a `Stream`.
pub fn event_stream(capacity: usize) -> (StreamEmitter, ReceiverStream<AnalysisEvent>) {
    let (emitter, rx) = channel(capacity);
    (emitter, ReceiverStream::new(rx))
}

impl StreamEmitter {
    pub async fn emit(&self, event: AnalysisEvent) -> Result<()> {
        tracing::trace!(kind = event.kind(), "emit");
        self.tx
            .send(event)
            .await
            .map_err(|_| AnalysisError::StreamTransport)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiving side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
