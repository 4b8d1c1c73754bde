//! Concurrent first-success-wins dispatch over a list of specs.

use crate::error::{Error, ErrorKind};
use crate::orchestrator::{ChatArgs, Orchestrator};
use crate::registry::Spec;
use crate::types::ChatResponse;
use tokio::sync::mpsc;

/// Race composer. All specs dispatch concurrently under a shared child
/// cancellation scope. The first success cancels the siblings and wins;
/// sibling errors after that are logged at debug and never surfaced. If
/// every spec fails, the result is `AllFailed` with per-spec causes in
/// input order. Caller cancellation cancels everything and returns
/// `Canceled`.
pub struct Race {
    orch: Orchestrator,
    specs: Vec<Spec>,
}

impl Race {
    pub(crate) fn new(orch: Orchestrator, specs: Vec<Spec>) -> Self {
        Self { orch, specs }
    }

    pub async fn chat(&self, args: impl Into<ChatArgs>) -> Result<ChatResponse, Error> {
        let args = args.into();
        if self.specs.is_empty() {
            return Err(Error::config("race requires at least one spec"));
        }

        let shared = args.cancel.child_token();
        let (tx, mut rx) = mpsc::channel(self.specs.len());

        for (index, spec) in self.specs.iter().enumerate() {
            let orch = self.orch.clone();
            let request = spec.apply(args.request.clone());
            let cancel = shared.clone();
            let spec = spec.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = orch
                    .chat(ChatArgs { request, cancel })
                    .await;
                if let Err(err) = &result {
                    tracing::debug!(
                        provider = %spec.provider,
                        model = %spec.model,
                        kind = %err.kind,
                        "race sibling failed"
                    );
                }
                // Receiver may be gone once a winner returned.
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut causes: Vec<Option<Error>> = (0..self.specs.len()).map(|_| None).collect();
        let mut failed = 0usize;
        loop {
            tokio::select! {
                _ = args.cancel.cancelled() => {
                    shared.cancel();
                    return Err(Error::canceled());
                }
                received = rx.recv() => match received {
                    Some((_, Ok(response))) => {
                        shared.cancel();
                        return Ok(response);
                    }
                    Some((index, Err(err))) => {
                        causes[index] = Some(err);
                        failed += 1;
                        if failed == self.specs.len() {
                            let causes = causes
                                .into_iter()
                                .map(|c| c.expect("every spec reported"))
                                .collect();
                            return Err(Error::all_failed(causes));
                        }
                    }
                    None => {
                        // All senders gone without a winner; only possible if
                        // tasks were torn down externally.
                        return Err(Error::new(ErrorKind::AllFailed, "race produced no result"));
                    }
                }
            }
        }
    }
}
