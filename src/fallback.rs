//! Sequential try-next-on-failure over an ordered list of specs.

use crate::error::Error;
use crate::orchestrator::{ChatArgs, Orchestrator};
use crate::registry::Spec;
use crate::types::ChatResponse;

/// Ordered fallback composer. Each spec gets the full reliability stack
/// (retry included); any exhausted or non-recoverable error advances to the
/// next spec. `BreakerOpen` and `ConfigError` advance the chain too. If
/// every spec fails, the *last* error is returned. Caller cancellation is
/// returned as-is and stops the chain.
pub struct Fallback {
    orch: Orchestrator,
    specs: Vec<Spec>,
}

impl Fallback {
    pub(crate) fn new(orch: Orchestrator, specs: Vec<Spec>) -> Self {
        Self { orch, specs }
    }

    pub async fn chat(&self, args: impl Into<ChatArgs>) -> Result<ChatResponse, Error> {
        let args = args.into();
        if self.specs.is_empty() {
            return Err(Error::config("fallback requires at least one spec"));
        }

        let mut last = None;
        for spec in &self.specs {
            let attempt = ChatArgs {
                request: spec.apply(args.request.clone()),
                cancel: args.cancel.clone(),
            };
            match self.orch.chat(attempt).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_canceled() => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        provider = %spec.provider,
                        model = %spec.model,
                        kind = %err.kind,
                        "fallback spec failed, advancing"
                    );
                    last = Some(err);
                }
            }
        }
        Err(last.expect("non-empty spec list"))
    }
}
