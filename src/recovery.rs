// Recovery strategy execution
// Runs the policy-selected strategies for a classified failure, in order, until one succeeds

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;

use crate::backoff;
use crate::cancellation::CancelToken;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
use crate::classifier::{ErrorClassifier, OperationContext};
use crate::clock::{Clock, SystemClock};
use crate::config::RecoveryConfiguration;
use crate::error::{AttemptError, Cancelled, CircuitBreakerError, Result};
use crate::logging::utils::{log_attempt, log_escalation, log_recovery_result, recovery_span};
use crate::policy::{RecoveryPolicy, RecoveryStrategy};
use crate::taxonomy::ErrorDetails;

/// Arguments for one call of a recoverable operation
#[derive(Debug, Clone)]
pub struct Invocation<A> {
    /// Identifies the dependency or operation family; keys retry budgets, breakers and fallbacks
    pub operation_key: String,
    pub args: A,
    /// Reduced-scope arguments used by graceful degradation
    pub degraded_args: Option<A>,
}

impl<A> Invocation<A> {
    pub fn new(operation_key: impl Into<String>, args: A) -> Self {
        Self {
            operation_key: operation_key.into(),
            args,
            degraded_args: None,
        }
    }

    pub fn with_degraded_args(mut self, args: A) -> Self {
        self.degraded_args = Some(args);
        self
    }
}

/// One strategy execution; one per try for retries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAttempt {
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AttemptError>,
    pub metadata: Map<String, Value>,
}

impl RecoveryAttempt {
    fn succeeded(strategy: RecoveryStrategy, metadata: Map<String, Value>) -> Self {
        Self {
            strategy,
            success: true,
            timestamp: Utc::now(),
            error: None,
            metadata,
        }
    }

    fn failed(strategy: RecoveryStrategy, error: AttemptError, metadata: Map<String, Value>) -> Self {
        Self {
            strategy,
            success: false,
            timestamp: Utc::now(),
            error: Some(error),
            metadata,
        }
    }

    pub fn is_escalation(&self) -> bool {
        self.strategy == RecoveryStrategy::Escalation
            && self.metadata.get("escalated") == Some(&Value::Bool(true))
    }
}

/// Outcome of a recovery run
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult<T> {
    success: bool,
    strategy_used: Option<RecoveryStrategy>,
    attempts: Vec<RecoveryAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ErrorDetails>,
}

impl<T> RecoveryResult<T> {
    /// The operation succeeded on its first invocation
    pub fn immediate(value: T) -> Self {
        Self {
            success: true,
            strategy_used: None,
            attempts: Vec::new(),
            result: Some(value),
            error_details: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn strategy_used(&self) -> Option<RecoveryStrategy> {
        self.strategy_used
    }

    pub fn attempts(&self) -> &[RecoveryAttempt] {
        &self.attempts
    }

    pub fn attempts_for(&self, strategy: RecoveryStrategy) -> impl Iterator<Item = &RecoveryAttempt> {
        self.attempts.iter().filter(move |a| a.strategy == strategy)
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.result
    }

    pub fn error_details(&self) -> Option<&ErrorDetails> {
        self.error_details.as_ref()
    }

    /// True when an escalation was recorded and a human has to act
    pub fn requires_intervention(&self) -> bool {
        self.attempts.iter().any(RecoveryAttempt::is_escalation)
    }

    pub fn was_cancelled(&self) -> bool {
        self.attempts
            .last()
            .and_then(|a| a.error.as_ref())
            .is_some_and(AttemptError::is_cancelled)
    }

    /// Convert into a plain `Result`, carrying the original failure on error
    pub fn into_result(self) -> std::result::Result<T, RecoveryFailure> {
        match self.result {
            Some(value) if self.success => Ok(value),
            _ => Err(RecoveryFailure {
                details: self.error_details,
                attempts: self.attempts,
            }),
        }
    }

    /// Message suitable for an end user
    pub fn user_facing_message(&self) -> String {
        if self.success {
            return match self.strategy_used {
                Some(strategy) => format!(
                    "Recovered after {} attempt(s) using {}",
                    self.attempts.len(),
                    strategy
                ),
                None => "Operation completed".to_string(),
            };
        }

        let mut message = match &self.error_details {
            Some(details) => details
                .user_message()
                .unwrap_or(details.message())
                .to_string(),
            None => "Operation failed".to_string(),
        };
        if self.requires_intervention() {
            message.push_str(" Manual intervention has been requested.");
        } else if let Some(suggestion) = self
            .error_details
            .as_ref()
            .and_then(ErrorDetails::recovery_suggestion)
        {
            message.push(' ');
            message.push_str(suggestion);
        }
        message
    }
}

/// Every strategy failed; carries the original classification
#[derive(Debug, Clone, Error)]
#[error("recovery failed after {} attempt(s){}", .attempts.len(), describe(.details))]
pub struct RecoveryFailure {
    pub details: Option<ErrorDetails>,
    pub attempts: Vec<RecoveryAttempt>,
}

fn describe(details: &Option<ErrorDetails>) -> String {
    details
        .as_ref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

type FallbackFn<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

enum StrategyOutcome<T> {
    Recovered(T),
    Failed,
    Escalated,
    Cancelled,
    Aborted,
}

/// Append-only attempt log for one `execute` call
struct AttemptLog<'a> {
    operation_key: &'a str,
    attempts: Vec<RecoveryAttempt>,
}

impl<'a> AttemptLog<'a> {
    fn new(operation_key: &'a str) -> Self {
        Self {
            operation_key,
            attempts: Vec::new(),
        }
    }

    fn push(&mut self, attempt: RecoveryAttempt) {
        log_attempt(self.operation_key, &attempt);
        self.attempts.push(attempt);
    }

    fn success(&mut self, strategy: RecoveryStrategy, metadata: Map<String, Value>) {
        self.push(RecoveryAttempt::succeeded(strategy, metadata));
    }

    fn failure(&mut self, strategy: RecoveryStrategy, error: AttemptError, metadata: Map<String, Value>) {
        self.push(RecoveryAttempt::failed(strategy, error, metadata));
    }

    fn finish<T>(
        self,
        strategy_used: Option<RecoveryStrategy>,
        result: Option<T>,
        details: &ErrorDetails,
    ) -> RecoveryResult<T> {
        let success = result.is_some();
        log_recovery_result(self.operation_key, success, strategy_used, self.attempts.len());
        RecoveryResult {
            success,
            strategy_used,
            attempts: self.attempts,
            result,
            error_details: Some(details.clone()),
        }
    }
}

/// Executes recovery policies. Holds the per-key retry budgets, circuit breakers
/// and fallbacks; share one instance across callers of the same dependencies.
#[derive(Debug)]
pub struct RecoveryExecutor {
    config: RecoveryConfiguration,
    policy: RecoveryPolicy,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    retry_budgets: DashMap<String, Arc<AtomicU32>>,
    fallbacks: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl RecoveryExecutor {
    pub fn new(config: RecoveryConfiguration, policy: RecoveryPolicy) -> Result<Self> {
        config.validate()?;
        policy.validate()?;
        Ok(Self {
            config,
            policy,
            clock: Arc::new(SystemClock),
            breakers: DashMap::new(),
            retry_budgets: DashMap::new(),
            fallbacks: DashMap::new(),
        })
    }

    /// Time source for circuit breakers created from now on
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RecoveryConfiguration {
        &self.config
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Register the alternate implementation used by the Fallback strategy for `key`
    pub fn register_fallback<A, T, F, Fut>(&self, key: impl Into<String>, fallback: F)
    where
        A: 'static,
        T: 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let boxed: FallbackFn<A, T> =
            Arc::new(move |args: A| -> BoxFuture<'static, anyhow::Result<T>> {
                Box::pin(fallback(args))
            });
        self.fallbacks.insert(key.into(), Arc::new(boxed));
    }

    pub fn unregister_fallback(&self, key: &str) -> bool {
        self.fallbacks.remove(key).is_some()
    }

    pub fn circuit_breaker_state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|breaker| breaker.state())
    }

    pub fn circuit_breaker_snapshot(&self, key: &str) -> Option<CircuitBreakerSnapshot> {
        self.breakers.get(key).map(|breaker| breaker.snapshot())
    }

    /// Drop the breaker for `key`; the next CircuitBreaker strategy starts Closed
    pub fn reset_circuit_breaker(&self, key: &str) -> bool {
        self.breakers.remove(key).is_some()
    }

    /// Retry slots currently claimed for `key`
    pub fn retry_count(&self, key: &str) -> u32 {
        self.retry_budgets
            .get(key)
            .map_or(0, |counter| counter.load(Ordering::SeqCst))
    }

    pub fn reset_retry_counter(&self, key: &str) {
        if let Some(counter) = self.retry_budgets.get(key) {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// Forget every breaker and retry budget; fallbacks stay registered
    pub fn reset_all(&self) {
        self.breakers.clear();
        self.retry_budgets.clear();
    }

    /// Run the recovery policy for an observed failure.
    ///
    /// Never returns an error: when no strategy succeeds the result has
    /// `success == false` and the caller decides whether to propagate.
    pub async fn execute<A, T, F, Fut>(
        &self,
        cancel: &CancelToken,
        details: &ErrorDetails,
        invocation: Invocation<A>,
        operation: F,
    ) -> RecoveryResult<T>
    where
        A: Clone + 'static,
        T: 'static,
        F: Fn(A) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let span = recovery_span(&invocation.operation_key, details.kind());
        self.execute_strategies(cancel, details, &invocation, &operation)
            .instrument(span)
            .await
    }

    async fn execute_strategies<A, T, F, Fut>(
        &self,
        cancel: &CancelToken,
        details: &ErrorDetails,
        invocation: &Invocation<A>,
        operation: &F,
    ) -> RecoveryResult<T>
    where
        A: Clone + 'static,
        T: 'static,
        F: Fn(A) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = invocation.operation_key.as_str();
        let mut log = AttemptLog::new(key);

        for &strategy in self.policy.strategies_for(details.kind()) {
            if cancel.is_cancelled() {
                log.failure(strategy, AttemptError::Cancelled, Map::new());
                break;
            }

            let outcome = match strategy {
                RecoveryStrategy::Retry => self.retry(cancel, invocation, operation, &mut log).await,
                RecoveryStrategy::Fallback => self.fallback(cancel, invocation, &mut log).await,
                RecoveryStrategy::GracefulDegradation => {
                    self.degrade(cancel, invocation, operation, &mut log).await
                }
                RecoveryStrategy::CircuitBreaker => {
                    self.through_breaker(cancel, invocation, operation, &mut log)
                        .await
                }
                RecoveryStrategy::Escalation => {
                    log_escalation(key, details);
                    log.success(
                        strategy,
                        metadata([
                            ("escalated", json!(true)),
                            ("requires_intervention", json!(true)),
                        ]),
                    );
                    StrategyOutcome::Escalated
                }
                RecoveryStrategy::Abort => {
                    log.failure(strategy, AttemptError::Aborted, Map::new());
                    StrategyOutcome::Aborted
                }
            };

            match outcome {
                StrategyOutcome::Recovered(value) => {
                    return log.finish(Some(strategy), Some(value), details);
                }
                StrategyOutcome::Failed | StrategyOutcome::Escalated => continue,
                StrategyOutcome::Cancelled | StrategyOutcome::Aborted => break,
            }
        }

        log.finish(None, None, details)
    }

    async fn retry<A, T, F, Fut>(
        &self,
        cancel: &CancelToken,
        invocation: &Invocation<A>,
        operation: &F,
        log: &mut AttemptLog<'_>,
    ) -> StrategyOutcome<T>
    where
        A: Clone,
        F: Fn(A) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = invocation.operation_key.as_str();
        let budget = self.retry_budget(key);
        let max_attempts = self.config.max_retry_attempts;

        // Each call is bounded on its own as well as through the shared budget
        for _ in 0..max_attempts {
            let claimed = budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < max_attempts).then_some(used + 1)
            });
            let attempt = match claimed {
                Ok(previous) => previous + 1,
                Err(_) => {
                    tracing::debug!(operation_key = key, max_attempts, "Retry budget exhausted");
                    return StrategyOutcome::Failed;
                }
            };

            let delay = backoff::delay(attempt - 1, &self.config);
            let meta = metadata([
                ("attempt", json!(attempt)),
                ("delay_ms", json!(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))),
            ]);

            if race(cancel, tokio::time::sleep(delay)).await.is_none() {
                log.failure(RecoveryStrategy::Retry, AttemptError::Cancelled, meta);
                return StrategyOutcome::Cancelled;
            }

            match race(cancel, operation(invocation.args.clone())).await {
                Some(Ok(value)) => {
                    budget.store(0, Ordering::SeqCst);
                    log.success(RecoveryStrategy::Retry, meta);
                    return StrategyOutcome::Recovered(value);
                }
                Some(Err(error)) => {
                    log.failure(RecoveryStrategy::Retry, AttemptError::operation(&error), meta);
                    if attempt == max_attempts {
                        // only the holder of the final slot starts the next round
                        budget.store(0, Ordering::SeqCst);
                        return StrategyOutcome::Failed;
                    }
                }
                None => {
                    log.failure(RecoveryStrategy::Retry, AttemptError::Cancelled, meta);
                    return StrategyOutcome::Cancelled;
                }
            }
        }

        StrategyOutcome::Failed
    }

    async fn fallback<A, T>(
        &self,
        cancel: &CancelToken,
        invocation: &Invocation<A>,
        log: &mut AttemptLog<'_>,
    ) -> StrategyOutcome<T>
    where
        A: Clone + 'static,
        T: 'static,
    {
        let key = invocation.operation_key.as_str();
        let registered = self.fallbacks.get(key).map(|entry| Arc::clone(entry.value()));
        let Some(registered) = registered else {
            log.failure(
                RecoveryStrategy::Fallback,
                AttemptError::NoFallbackRegistered { key: key.to_string() },
                Map::new(),
            );
            return StrategyOutcome::Failed;
        };
        let Some(fallback) = registered.downcast_ref::<FallbackFn<A, T>>().cloned() else {
            log.failure(
                RecoveryStrategy::Fallback,
                AttemptError::FallbackTypeMismatch { key: key.to_string() },
                Map::new(),
            );
            return StrategyOutcome::Failed;
        };

        self.settle(
            RecoveryStrategy::Fallback,
            race(cancel, fallback(invocation.args.clone())).await,
            Map::new(),
            log,
        )
    }

    async fn degrade<A, T, F, Fut>(
        &self,
        cancel: &CancelToken,
        invocation: &Invocation<A>,
        operation: &F,
        log: &mut AttemptLog<'_>,
    ) -> StrategyOutcome<T>
    where
        A: Clone,
        F: Fn(A) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let Some(degraded) = invocation.degraded_args.clone() else {
            log.failure(
                RecoveryStrategy::GracefulDegradation,
                AttemptError::NoDegradedArguments,
                Map::new(),
            );
            return StrategyOutcome::Failed;
        };

        self.settle(
            RecoveryStrategy::GracefulDegradation,
            race(cancel, operation(degraded)).await,
            metadata([("degraded", json!(true))]),
            log,
        )
    }

    async fn through_breaker<A, T, F, Fut>(
        &self,
        cancel: &CancelToken,
        invocation: &Invocation<A>,
        operation: &F,
        log: &mut AttemptLog<'_>,
    ) -> StrategyOutcome<T>
    where
        A: Clone,
        F: Fn(A) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = invocation.operation_key.as_str();
        let breaker = self.breaker(key);

        let outcome = breaker
            .call_if(
                move || async move {
                    match race(cancel, operation(invocation.args.clone())).await {
                        Some(Ok(value)) => Ok(value),
                        Some(Err(error)) => Err(Some(error)),
                        None => Err(None),
                    }
                },
                |error: &Option<anyhow::Error>| error.is_some(),
            )
            .await;

        let outcome = match outcome {
            Ok(value) => Some(Ok(value)),
            Err(CircuitBreakerError::Operation(Some(error))) => Some(Err(error)),
            Err(CircuitBreakerError::Operation(None)) => None,
            Err(CircuitBreakerError::Open(open)) => {
                log.failure(
                    RecoveryStrategy::CircuitBreaker,
                    AttemptError::CircuitOpen {
                        key: open.key,
                        retry_after_ms: u64::try_from(open.retry_after.as_millis())
                            .unwrap_or(u64::MAX),
                    },
                    Map::new(),
                );
                return StrategyOutcome::Failed;
            }
        };

        self.settle(RecoveryStrategy::CircuitBreaker, outcome, Map::new(), log)
    }

    /// Record the outcome of a single invocation made by a strategy
    fn settle<T>(
        &self,
        strategy: RecoveryStrategy,
        outcome: Option<anyhow::Result<T>>,
        meta: Map<String, Value>,
        log: &mut AttemptLog<'_>,
    ) -> StrategyOutcome<T> {
        match outcome {
            Some(Ok(value)) => {
                log.success(strategy, meta);
                StrategyOutcome::Recovered(value)
            }
            Some(Err(error)) => {
                log.failure(strategy, AttemptError::operation(&error), meta);
                StrategyOutcome::Failed
            }
            None => {
                log.failure(strategy, AttemptError::Cancelled, meta);
                StrategyOutcome::Cancelled
            }
        }
    }

    fn retry_budget(&self, key: &str) -> Arc<AtomicU32> {
        if let Some(counter) = self.retry_budgets.get(key) {
            return Arc::clone(counter.value());
        }
        Arc::clone(
            self.retry_budgets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AtomicU32::new(0)))
                .value(),
        )
    }

    fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(key) {
            return Arc::clone(breaker.value());
        }
        Arc::clone(
            self.breakers
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::from_config(
                        key,
                        &self.config,
                        Arc::clone(&self.clock),
                    ))
                })
                .value(),
        )
    }
}

/// Classifies failures and drives recovery for them
#[derive(Debug)]
pub struct RecoveryEngine {
    classifier: ErrorClassifier,
    executor: RecoveryExecutor,
}

impl RecoveryEngine {
    pub fn new(classifier: ErrorClassifier, executor: RecoveryExecutor) -> Self {
        Self {
            classifier,
            executor,
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn executor(&self) -> &RecoveryExecutor {
        &self.executor
    }

    /// Invoke `operation` once; on failure classify the error and run recovery.
    ///
    /// A first-try success returns `success` with no strategy and no attempts.
    pub async fn run<A, T, F, Fut>(
        &self,
        cancel: &CancelToken,
        context: &OperationContext,
        invocation: Invocation<A>,
        operation: F,
    ) -> RecoveryResult<T>
    where
        A: Clone + 'static,
        T: 'static,
        F: Fn(A) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let details = match race(cancel, operation(invocation.args.clone())).await {
            Some(Ok(value)) => return RecoveryResult::immediate(value),
            Some(Err(error)) => self.classifier.classify_anyhow(&error, context),
            None => self.classifier.classify(&Cancelled, context),
        };

        self.executor
            .execute(cancel, &details, invocation, operation)
            .await
    }
}

/// Race `future` against the token; `None` means the token fired first
async fn race<F: Future>(cancel: &CancelToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}

fn metadata<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
