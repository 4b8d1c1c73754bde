//! The orchestrator: binding selection, the reliability stack, events, and
//! cost accounting behind one `chat` / `stream_chat` surface.
//!
//! Per attempt the stack runs breaker admission → limiter admission →
//! deadline-bounded provider call → classification and breaker recording.
//! The retry executor wraps the whole attempt; the middleware onion wraps
//! the retry loop. Composers (`fallback`, `race`, `map`) reuse this unary
//! path unchanged.

use crate::breaker::{BreakerConfig, BreakerRegistry, BreakerTransition, CircuitBreaker, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::cost::CostCounter;
use crate::error::{BuildError, Error, ErrorKind};
use crate::events::{EventBus, EventRecord, EventSink};
use crate::fallback::Fallback;
use crate::fanout::{self, MapOptions};
use crate::limiter::{RateLimit, RateLimiter};
use crate::middleware::{CallContext, Endpoint, Middleware, Next};
use crate::provider::{CallOptions, ChatProvider, ChatStream};
use crate::race::Race;
use crate::registry::{Binding, ProviderRegistry, Spec};
use crate::retry::RetryPolicy;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::types::{ChatRequest, ChatResponse};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A unary or streaming call: the request plus the caller's cancellation
/// scope. `ChatRequest` converts directly for the common uncancelled case.
#[derive(Debug, Clone)]
pub struct ChatArgs {
    pub request: ChatRequest,
    pub cancel: CancellationToken,
}

impl ChatArgs {
    pub fn new(request: ChatRequest) -> Self {
        Self { request, cancel: CancellationToken::new() }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl From<ChatRequest> for ChatArgs {
    fn from(request: ChatRequest) -> Self {
        Self::new(request)
    }
}

pub struct OrchestratorBuilder {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    registry: Option<ProviderRegistry>,
    limits: HashMap<String, RateLimit>,
    retry: RetryPolicy,
    breaker: BreakerConfig,
    timeout: Option<Duration>,
    middleware: Vec<Arc<dyn Middleware>>,
    observers: Vec<EventSink>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            registry: None,
            limits: HashMap::new(),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            timeout: None,
            middleware: Vec::new(),
            observers: Vec::new(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
        }
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own `id()`.
    pub fn provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.providers.insert(provider.id().to_string(), provider);
        self
    }

    /// Attach a prebuilt registry for logical-name resolution. Without one,
    /// every request must use direct addressing.
    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Rate limit for a binding key (`"provider:model"`).
    pub fn limit(mut self, key: impl Into<String>, limit: RateLimit) -> Self {
        self.limits.insert(key.into(), limit);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Per-attempt deadline. Default: none.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn middleware(mut self, hook: Arc<dyn Middleware>) -> Self {
        self.middleware.push(hook);
        self
    }

    /// Register an observer created with [`crate::events::observer`].
    pub fn observer(mut self, sink: EventSink) -> Self {
        self.observers.push(sink);
        self
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        if self.providers.is_empty() {
            return Err(BuildError::NoProviders);
        }
        if let Some(registry) = &self.registry {
            for key in registry.provider_keys() {
                if !self.providers.contains_key(&key) {
                    return Err(BuildError::UnknownProvider { key });
                }
            }
        }
        for (key, limit) in &self.limits {
            if !(limit.rps > 0.0) {
                return Err(BuildError::InvalidRate { key: key.clone(), rps: limit.rps });
            }
            if limit.burst < limit.rps {
                return Err(BuildError::InvalidBurst {
                    key: key.clone(),
                    burst: limit.burst,
                    rps: limit.rps,
                });
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts);
        }
        if self.breaker.failure_threshold == 0 {
            return Err(BuildError::InvalidFailureThreshold);
        }
        if self.breaker.half_open_probes == 0 {
            return Err(BuildError::InvalidHalfOpenProbes);
        }

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                providers: self.providers,
                registry: self.registry,
                limiter: RateLimiter::new(self.limits, self.clock.clone(), self.sleeper.clone()),
                breakers: BreakerRegistry::new(self.breaker, self.clock),
                retry: self.retry,
                timeout: self.timeout,
                middleware: self.middleware,
                events: EventBus::new(self.observers),
                cost: CostCounter::default(),
                sleeper: self.sleeper,
            }),
        })
    }
}

pub(crate) struct Inner {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    registry: Option<ProviderRegistry>,
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    middleware: Vec<Arc<dyn Middleware>>,
    events: EventBus,
    cost: CostCounter,
    sleeper: Arc<dyn Sleeper>,
}

/// Multi-provider router instance. Cheap to clone; clones share limiter,
/// breaker, cost, and event state. Separate instances share nothing.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Cumulative USD across all successful calls. Monotone non-decreasing.
    pub fn total_cost_usd(&self) -> f64 {
        self.inner.cost.total()
    }

    /// Events lost to saturated observers.
    pub fn events_dropped(&self) -> u64 {
        self.inner.events.dropped()
    }

    /// Breaker state for a binding key, if any call has touched it.
    pub fn breaker_state(&self, binding_key: &str) -> Option<CircuitState> {
        self.inner.breakers.state(binding_key)
    }

    /// Sequential try-next-on-failure over the given specs.
    pub fn fallback(&self, specs: Vec<Spec>) -> Fallback {
        Fallback::new(self.clone(), specs)
    }

    /// Concurrent first-success-wins over the given specs.
    pub fn race(&self, specs: Vec<Spec>) -> Race {
        Race::new(self.clone(), specs)
    }

    /// Bounded-concurrency fan-out preserving input order.
    pub async fn map<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        f: F,
        opts: MapOptions,
    ) -> Result<Vec<Result<R, Error>>, Error>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        fanout::map(items, f, opts).await
    }

    /// One unary chat call through selection, middleware, and the
    /// reliability stack.
    pub async fn chat(&self, args: impl Into<ChatArgs>) -> Result<ChatResponse, Error> {
        let args = args.into();
        validate_request(&args.request)?;
        let binding = self.resolve_binding(&args.request)?;
        let key = binding.key();
        let request_id = uuid::Uuid::new_v4().to_string();

        self.inner.events.emit(EventRecord::CallStart {
            binding: key.clone(),
            request_id: request_id.clone(),
        });

        let mut ctx = CallContext::new(binding, args.request.clone(), request_id.clone());
        let endpoint = ReliabilityEndpoint {
            inner: &self.inner,
            cancel: &args.cancel,
            attempts: AtomicU32::new(0),
        };
        let result = Next::new(&self.inner.middleware, &endpoint).run(&mut ctx).await;
        ctx.ended_at = Some(Instant::now());

        match result {
            Ok(response) => {
                self.inner.events.emit(EventRecord::CallSuccess {
                    binding: key,
                    request_id,
                    attempts: endpoint.attempts.load(Ordering::Relaxed),
                    cost_usd: response.cost_usd,
                });
                Ok(response)
            }
            Err(err) => {
                let err = if err.binding.is_none() { err.with_binding(key.clone()) } else { err };
                let err = if err.request_id.is_none() {
                    err.with_request_id(request_id.clone())
                } else {
                    err
                };
                self.inner.events.emit(EventRecord::CallError {
                    binding: key,
                    request_id,
                    attempts: err.attempts,
                    kind: err.kind,
                });
                Err(err)
            }
        }
    }

    /// Streaming chat. Selection and per-attempt admission match the unary
    /// path; a retryable failure may restart the stream until the first
    /// delta has been yielded, after which errors surface unmodified.
    pub async fn stream_chat(&self, args: impl Into<ChatArgs>) -> Result<ChatStream, Error> {
        let args = args.into();
        validate_request(&args.request)?;
        let binding = self.resolve_binding(&args.request)?;
        let key = binding.key();
        let request_id = uuid::Uuid::new_v4().to_string();

        self.inner.events.emit(EventRecord::CallStart {
            binding: key.clone(),
            request_id: request_id.clone(),
        });

        let inner = self.inner.clone();
        let request = args.request;
        let cancel = args.cancel;

        let stream = try_stream! {
            let mut attempt: u32 = 1;
            'attempts: loop {
                match open_stream(&inner, &binding, &request, &request_id, &cancel).await {
                    Err(err) => match inner.retry.delay_for(attempt, &err) {
                        Some(wait) => {
                            inner.events.emit(EventRecord::CallRetry {
                                binding: key.clone(),
                                request_id: request_id.clone(),
                                attempt,
                                wait,
                                kind: err.kind,
                            });
                            let canceled = tokio::select! {
                                _ = cancel.cancelled() => true,
                                _ = inner.sleeper.sleep(wait) => false,
                            };
                            if canceled {
                                emit_stream_error(&inner, &key, &request_id, attempt, ErrorKind::Canceled);
                                Err::<(), _>(Error::canceled().with_attempts(attempt))?;
                            }
                            attempt += 1;
                        }
                        None => {
                            emit_stream_error(&inner, &key, &request_id, attempt, err.kind);
                            Err::<(), _>(err.with_attempts(attempt))?;
                            break 'attempts;
                        }
                    },
                    Ok((mut frames, pass, breaker)) => {
                        let mut yielded = false;
                        loop {
                            enum StepOutcome {
                                Canceled,
                                Item(Option<Result<crate::types::ChatDelta, Error>>),
                            }
                            let outcome = tokio::select! {
                                _ = cancel.cancelled() => StepOutcome::Canceled,
                                item = frames.next() => StepOutcome::Item(item),
                            };
                            match outcome {
                                StepOutcome::Canceled => {
                                    breaker.record_ignored(pass);
                                    emit_stream_error(&inner, &key, &request_id, attempt, ErrorKind::Canceled);
                                    Err::<(), _>(Error::canceled().with_attempts(attempt))?;
                                    break 'attempts;
                                }
                                StepOutcome::Item(item) => match item {
                                    Some(Ok(delta)) => {
                                        yielded = true;
                                        yield delta;
                                    }
                                    Some(Err(err)) => {
                                        let err = err
                                            .with_binding(key.clone())
                                            .with_request_id(request_id.clone());
                                        record_error(&inner, &breaker, pass, &key, &err);
                                        if !yielded {
                                            if let Some(wait) = inner.retry.delay_for(attempt, &err) {
                                                inner.events.emit(EventRecord::CallRetry {
                                                    binding: key.clone(),
                                                    request_id: request_id.clone(),
                                                    attempt,
                                                    wait,
                                                    kind: err.kind,
                                                });
                                                let canceled = tokio::select! {
                                                    _ = cancel.cancelled() => true,
                                                    _ = inner.sleeper.sleep(wait) => false,
                                                };
                                                if canceled {
                                                    emit_stream_error(
                                                        &inner, &key, &request_id, attempt,
                                                        ErrorKind::Canceled,
                                                    );
                                                    Err::<(), _>(Error::canceled().with_attempts(attempt))?;
                                                }
                                                attempt += 1;
                                                continue 'attempts;
                                            }
                                        }
                                        emit_stream_error(&inner, &key, &request_id, attempt, err.kind);
                                        Err::<(), _>(err.with_attempts(attempt))?;
                                        break 'attempts;
                                    }
                                    None => {
                                        if let Some(BreakerTransition::Closed) = breaker.record_success(pass) {
                                            inner.events.emit(EventRecord::BreakerClose {
                                                binding: key.clone(),
                                            });
                                        }
                                        inner.events.emit(EventRecord::CallSuccess {
                                            binding: key.clone(),
                                            request_id: request_id.clone(),
                                            attempts: attempt,
                                            cost_usd: None,
                                        });
                                        break 'attempts;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn resolve_binding(&self, request: &ChatRequest) -> Result<Binding, Error> {
        match &request.provider {
            Some(provider_key) => {
                if !self.inner.providers.contains_key(provider_key) {
                    return Err(Error::config(format!("unknown provider {provider_key:?}")));
                }
                let price = self
                    .inner
                    .registry
                    .as_ref()
                    .and_then(|r| r.lookup_price(provider_key, &request.model));
                let mut binding = Binding::new(provider_key.clone(), request.model.clone());
                binding.price = price;
                Ok(binding)
            }
            None => {
                let registry = self.inner.registry.as_ref().ok_or_else(|| {
                    Error::config(
                        "no registry configured; requests must address a provider directly",
                    )
                })?;
                registry.resolve(&request.model)
            }
        }
    }
}

fn validate_request(request: &ChatRequest) -> Result<(), Error> {
    if request.messages.is_empty() {
        return Err(Error::new(ErrorKind::ClientError, "request has no messages"));
    }
    if let Some(t) = request.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(Error::new(
                ErrorKind::ClientError,
                format!("temperature {t} outside [0, 2]"),
            ));
        }
    }
    if let Some(p) = request.top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::new(
                ErrorKind::ClientError,
                format!("top_p {p} outside [0, 1]"),
            ));
        }
    }
    if request.max_tokens == Some(0) {
        return Err(Error::new(ErrorKind::ClientError, "max_tokens must be positive"));
    }
    Ok(())
}

struct ReliabilityEndpoint<'a> {
    inner: &'a Inner,
    cancel: &'a CancellationToken,
    attempts: AtomicU32,
}

#[async_trait]
impl Endpoint for ReliabilityEndpoint<'_> {
    async fn call(&self, ctx: &mut CallContext) -> Result<ChatResponse, Error> {
        self.attempts.store(1, Ordering::Relaxed);
        let inner = self.inner;
        let key = ctx.binding.key();
        let breaker = inner.breakers.get_or_create(&key);
        let provider = inner
            .providers
            .get(&ctx.binding.provider_key)
            .cloned()
            .ok_or_else(|| {
                Error::config(format!("unknown provider {:?}", ctx.binding.provider_key))
            })?;

        let binding = ctx.binding.clone();
        let request = ctx.request.clone();
        let request_id = ctx.request_id.clone();
        let events_key = key.clone();
        let events_request_id = request_id.clone();

        let result = inner
            .retry
            .execute(
                self.cancel,
                inner.sleeper.as_ref(),
                |attempt, wait, error| {
                    self.attempts.store(attempt + 1, Ordering::Relaxed);
                    inner.events.emit(EventRecord::CallRetry {
                        binding: events_key.clone(),
                        request_id: events_request_id.clone(),
                        attempt,
                        wait,
                        kind: error.kind,
                    });
                },
                |_| {
                    run_attempt(
                        inner,
                        &breaker,
                        &provider,
                        &binding,
                        &request,
                        &request_id,
                        self.cancel,
                    )
                },
            )
            .await;

        match result {
            Ok(response) => {
                ctx.response = Some(response.clone());
                Ok(response)
            }
            Err(err) => {
                ctx.error = Some(err.kind);
                Err(err)
            }
        }
    }
}

/// One admission-to-classification attempt.
async fn run_attempt(
    inner: &Inner,
    breaker: &CircuitBreaker,
    provider: &Arc<dyn ChatProvider>,
    binding: &Binding,
    request: &ChatRequest,
    request_id: &str,
    cancel: &CancellationToken,
) -> Result<ChatResponse, Error> {
    let key = binding.key();
    if cancel.is_cancelled() {
        return Err(Error::canceled().with_binding(key).with_request_id(request_id));
    }

    let pass = match breaker.before_pass() {
        Ok(pass) => pass,
        Err(remaining) => {
            return Err(Error::breaker_open(remaining)
                .with_binding(key)
                .with_request_id(request_id))
        }
    };

    let wait_key = key.clone();
    let wait_request_id = request_id.to_string();
    if let Err(err) = inner
        .limiter
        .acquire(&key, cancel, |wait| {
            inner.events.emit(EventRecord::LimiterWait {
                binding: wait_key.clone(),
                request_id: wait_request_id.clone(),
                wait,
            });
        })
        .await
    {
        breaker.record_ignored(pass);
        return Err(err.with_binding(key).with_request_id(request_id));
    }

    let attempt_cancel = cancel.child_token();
    let opts = CallOptions { cancel: attempt_cancel.clone() };
    let started = Instant::now();
    let outcome = match inner.timeout {
        Some(limit) => {
            tokio::select! {
                result = provider.chat(request, &opts) => result,
                _ = tokio::time::sleep(limit) => {
                    attempt_cancel.cancel();
                    Err(Error::timeout(started.elapsed(), limit))
                }
                _ = cancel.cancelled() => Err(Error::canceled()),
            }
        }
        None => {
            tokio::select! {
                result = provider.chat(request, &opts) => result,
                _ = cancel.cancelled() => Err(Error::canceled()),
            }
        }
    };

    match outcome {
        Ok(mut response) => {
            if let Some(BreakerTransition::Closed) = breaker.record_success(pass) {
                inner.events.emit(EventRecord::BreakerClose { binding: key.clone() });
            }
            if response.cost_usd.is_none() {
                let price = binding.price.or_else(|| provider.price());
                if let Some(price) = price {
                    if response.usage.input.is_some() || response.usage.output.is_some() {
                        response.cost_usd = Some(price.cost(
                            response.usage.input.unwrap_or(0),
                            response.usage.output.unwrap_or(0),
                        ));
                    }
                }
            }
            if let Some(cost) = response.cost_usd {
                inner.cost.add(cost);
            }
            Ok(response)
        }
        Err(err) => {
            let err = err.with_binding(key.clone()).with_request_id(request_id);
            record_error(inner, breaker, pass, &key, &err);
            Err(err)
        }
    }
}

/// Record a classified failure against the breaker per the taxonomy table,
/// emitting `breaker.open` on a transition.
fn record_error(
    inner: &Inner,
    breaker: &CircuitBreaker,
    pass: crate::breaker::BreakerPass,
    key: &str,
    err: &Error,
) {
    if err.kind.counts_against_breaker() {
        if let Some(BreakerTransition::Opened { failures }) = breaker.record_failure(pass) {
            inner.events.emit(EventRecord::BreakerOpen {
                binding: key.to_string(),
                failures,
            });
        }
    } else {
        breaker.record_ignored(pass);
    }
}

fn emit_stream_error(inner: &Inner, key: &str, request_id: &str, attempts: u32, kind: ErrorKind) {
    inner.events.emit(EventRecord::CallError {
        binding: key.to_string(),
        request_id: request_id.to_string(),
        attempts,
        kind,
    });
}

/// Admit and open one streaming attempt, returning the frames plus the
/// breaker pass to be resolved when the stream ends.
async fn open_stream(
    inner: &Inner,
    binding: &Binding,
    request: &ChatRequest,
    request_id: &str,
    cancel: &CancellationToken,
) -> Result<(ChatStream, crate::breaker::BreakerPass, CircuitBreaker), Error> {
    let key = binding.key();
    if cancel.is_cancelled() {
        return Err(Error::canceled().with_binding(key).with_request_id(request_id));
    }

    let breaker = inner.breakers.get_or_create(&key);
    let pass = match breaker.before_pass() {
        Ok(pass) => pass,
        Err(remaining) => {
            return Err(Error::breaker_open(remaining)
                .with_binding(key)
                .with_request_id(request_id))
        }
    };

    let provider = match inner.providers.get(&binding.provider_key).cloned() {
        Some(provider) => provider,
        None => {
            breaker.record_ignored(pass);
            return Err(Error::config(format!(
                "unknown provider {:?}",
                binding.provider_key
            )));
        }
    };

    let wait_key = key.clone();
    let wait_request_id = request_id.to_string();
    if let Err(err) = inner
        .limiter
        .acquire(&key, cancel, |wait| {
            inner.events.emit(EventRecord::LimiterWait {
                binding: wait_key.clone(),
                request_id: wait_request_id.clone(),
                wait,
            });
        })
        .await
    {
        breaker.record_ignored(pass);
        return Err(err.with_binding(key).with_request_id(request_id));
    }

    let attempt_cancel = cancel.child_token();
    let opts = CallOptions { cancel: attempt_cancel.clone() };
    let started = Instant::now();
    let outcome = match inner.timeout {
        Some(limit) => {
            tokio::select! {
                result = provider.stream(request, &opts) => result,
                _ = tokio::time::sleep(limit) => {
                    attempt_cancel.cancel();
                    Err(Error::timeout(started.elapsed(), limit))
                }
                _ = cancel.cancelled() => Err(Error::canceled()),
            }
        }
        None => {
            tokio::select! {
                result = provider.stream(request, &opts) => result,
                _ = cancel.cancelled() => Err(Error::canceled()),
            }
        }
    };

    match outcome {
        Ok(frames) => Ok((frames, pass, breaker)),
        Err(err) => {
            let err = err.with_binding(key.clone()).with_request_id(request_id);
            record_error(inner, &breaker, pass, &key, &err);
            Err(err)
        }
    }
}
