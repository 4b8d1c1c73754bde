#![allow(dead_code)]

//! Shared test doubles: scripted providers and event helpers.

use async_trait::async_trait;
use modelmux::{
    CallOptions, ChatDelta, ChatProvider, ChatRequest, ChatResponse, ChatStream, Error,
    EventRecord, PriceTable, TokenUsage,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed(String),
    FailStatus(u16),
    FailRateLimited { retry_after: Duration },
}

/// Scripted unary provider. Each call consumes the next scripted outcome;
/// once the script is exhausted the default outcome repeats. An optional
/// delay runs before each outcome and cooperates with cancellation.
pub struct MockProvider {
    id: String,
    delay: Option<Duration>,
    script: Mutex<VecDeque<MockOutcome>>,
    default: MockOutcome,
    usage: TokenUsage,
    price: Option<PriceTable>,
    calls: AtomicUsize,
    last_cancel: Mutex<Option<CancellationToken>>,
}

impl MockProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            delay: None,
            script: Mutex::new(VecDeque::new()),
            default: MockOutcome::Succeed("ok".to_string()),
            usage: TokenUsage { input: Some(10), output: Some(20) },
            price: None,
            calls: AtomicUsize::new(0),
            last_cancel: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn then_ok(self, content: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(MockOutcome::Succeed(content.to_string()));
        self
    }

    pub fn then_status(self, status: u16) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(MockOutcome::FailStatus(status));
        self
    }

    pub fn then_rate_limited(self, retry_after: Duration) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(MockOutcome::FailRateLimited { retry_after });
        self
    }

    /// Outcome repeated once the script is exhausted.
    pub fn always(mut self, outcome: MockOutcome) -> Self {
        self.default = outcome;
        self
    }

    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage = TokenUsage { input: Some(input), output: Some(output) };
        self
    }

    pub fn with_price(mut self, price: PriceTable) -> Self {
        self.price = Some(price);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether the cancellation token of the most recent call has fired.
    pub fn cancel_observed(&self) -> bool {
        self.last_cancel
            .lock()
            .unwrap()
            .as_ref()
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, req: &ChatRequest, opts: &CallOptions) -> Result<ChatResponse, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_cancel.lock().unwrap() = Some(opts.cancel.clone());
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = opts.cancel.cancelled() => return Err(Error::canceled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        match self.next_outcome() {
            MockOutcome::Succeed(content) => Ok(ChatResponse {
                content,
                usage: self.usage,
                cost_usd: None,
                provider: self.id.clone(),
                model: req.model.clone(),
                raw: None,
            }),
            MockOutcome::FailStatus(status) => {
                Err(Error::from_status(status, format!("synthetic {status}")))
            }
            MockOutcome::FailRateLimited { retry_after } => Err(Error::from_status(
                429,
                "synthetic quota exceeded",
            )
            .with_retry_after(retry_after)),
        }
    }

    fn price(&self) -> Option<PriceTable> {
        self.price
    }
}

/// One frame of a scripted stream attempt.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Delta(&'static str),
    Delay(Duration),
    Fail(u16),
}

/// One scripted outcome of a `stream()` open.
#[derive(Debug, Clone)]
pub enum StreamOpen {
    FailOpen(u16),
    Frames(Vec<StreamFrame>),
}

/// Scripted streaming provider; `chat` is intentionally unsupported.
pub struct MockStreamProvider {
    id: String,
    opens: Mutex<VecDeque<StreamOpen>>,
    opens_count: AtomicUsize,
}

impl MockStreamProvider {
    pub fn new(id: &str, opens: Vec<StreamOpen>) -> Self {
        Self {
            id: id.to_string(),
            opens: Mutex::new(opens.into()),
            opens_count: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for MockStreamProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, _req: &ChatRequest, _opts: &CallOptions) -> Result<ChatResponse, Error> {
        Err(Error::from_status(400, "unary not scripted"))
    }

    async fn stream(&self, _req: &ChatRequest, opts: &CallOptions) -> Result<ChatStream, Error> {
        self.opens_count.fetch_add(1, Ordering::SeqCst);
        let open = self
            .opens
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StreamOpen::Frames(vec![]));
        match open {
            StreamOpen::FailOpen(status) => {
                Err(Error::from_status(status, format!("synthetic open {status}")))
            }
            StreamOpen::Frames(frames) => {
                let cancel = opts.cancel.clone();
                let stream = async_stream::try_stream! {
                    for frame in frames {
                        match frame {
                            StreamFrame::Delta(content) => {
                                yield ChatDelta {
                                    content: Some(content.to_string()),
                                    raw: None,
                                };
                            }
                            StreamFrame::Delay(delay) => {
                                let canceled = tokio::select! {
                                    _ = cancel.cancelled() => true,
                                    _ = tokio::time::sleep(delay) => false,
                                };
                                if canceled {
                                    Err::<(), _>(Error::canceled())?;
                                }
                            }
                            StreamFrame::Fail(status) => {
                                Err::<(), _>(Error::from_status(
                                    status,
                                    format!("synthetic frame {status}"),
                                ))?;
                            }
                        }
                    }
                };
                Ok(Box::pin(stream))
            }
        }
    }
}

/// Drain every event currently buffered on an observer channel.
pub fn drain_events(rx: &mut mpsc::Receiver<EventRecord>) -> Vec<EventRecord> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
