//! Single-response guard.
//!
//! Each handler runs in its own task and reports through a [`Responder`] that
//! accepts exactly one envelope. An optional timer races the handler; whichever
//! finishes first answers the sender and the loser is discarded. A fired timer
//! does not cancel the handler task, so in-flight requests still settle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::envelope::ResponseEnvelope;
use connectrelay_core::Error;

/// Accepts at most one response; later attempts are dropped.
pub struct Responder {
    label: String,
    slot: Mutex<Option<oneshot::Sender<ResponseEnvelope>>>,
}

impl Responder {
    pub fn channel(label: impl Into<String>) -> (Arc<Self>, oneshot::Receiver<ResponseEnvelope>) {
        let (tx, rx) = oneshot::channel();
        let responder = Arc::new(Self {
            label: label.into(),
            slot: Mutex::new(Some(tx)),
        });
        (responder, rx)
    }

    /// Deliver `envelope` if nothing has been delivered yet. Returns whether
    /// this call was the one that answered.
    pub fn respond(&self, envelope: ResponseEnvelope) -> bool {
        let tx = self.slot.lock().take();
        match tx {
            Some(tx) => {
                // Receiver gone means the caller stopped waiting; still counts as answered.
                let _ = tx.send(envelope);
                true
            }
            None => {
                debug!("{}: discarding late response", self.label);
                false
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Run `work` in its own task and return exactly one envelope: the work's
/// result, a timeout envelope if `limit` elapses first, or a failure envelope
/// if the work panics.
pub async fn run_guarded<F>(label: &str, limit: Option<Duration>, work: F) -> ResponseEnvelope
where
    F: Future<Output = ResponseEnvelope> + Send + 'static,
{
    let (responder, rx) = Responder::channel(label);

    let worker = responder.clone();
    let worker_label = label.to_string();
    tokio::spawn(async move {
        let envelope = match tokio::spawn(work).await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("{}: handler failed: {}", worker_label, e);
                ResponseEnvelope::failure(format!("Handler failed: {}", e))
            }
        };
        if !worker.respond(envelope) {
            warn!("{}: result arrived after timeout, dropped", worker_label);
        }
    });

    let timer = limit.map(|limit| {
        let guard = responder.clone();
        let guard_label = label.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if guard.respond(ResponseEnvelope::from_error(&Error::Timeout(limit))) {
                warn!("{}: timed out after {:?}", guard_label, limit);
            }
        })
    });

    let envelope = rx
        .await
        .unwrap_or_else(|_| ResponseEnvelope::failure("Response channel closed"));

    if let Some(timer) = timer {
        timer.abort();
    }
    envelope
}
