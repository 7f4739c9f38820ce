//! Capture of the documents a retriever produces as a side effect inside
//! the chain call. The cell is created before the chain is invoked, resolved
//! by the retriever, and awaited only after the chain call has settled, so
//! the await is non-blocking in practice.

use crate::models::SourceDocument;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, warn};

/// Creates the single-assignment cell for one turn.
pub fn document_capture() -> (CaptureHandle, DocumentCapture) {
    let (tx, rx) = oneshot::channel();
    (
        CaptureHandle {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        DocumentCapture { rx },
    )
}

/// Write side, cloned into the retriever. Resolves at most once; a second
/// resolution within the same turn is a retriever bug and is dropped loudly
/// instead of overwriting the first value.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<Vec<SourceDocument>>>>>,
}

impl CaptureHandle {
    pub fn resolve(&self, documents: Vec<SourceDocument>) {
        let sender = self.tx.lock().take();
        match sender {
            Some(tx) => {
                // Receiver dropped means the turn was abandoned; nothing to do.
                let _ = tx.send(documents);
            }
            None => {
                error!("retrieved documents resolved twice within one turn; second resolution dropped");
            }
        }
    }
}

/// Read side, awaited by the orchestrator after the chain call returns.
pub struct DocumentCapture {
    rx: oneshot::Receiver<Vec<SourceDocument>>,
}

impl DocumentCapture {
    /// Returns the captured documents, or an empty list when the chain
    /// completed without ever running retrieval (all handles dropped
    /// unresolved).
    pub async fn wait(self) -> Vec<SourceDocument> {
        match self.rx.await {
            Ok(documents) => documents,
            Err(_) => {
                warn!("chain completed without resolving retrieved documents");
                Vec::new()
            }
        }
    }
}
