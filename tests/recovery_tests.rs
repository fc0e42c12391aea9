// Strategy execution tests for the recovery executor and engine
// Time is paused so backoff sleeps complete instantly and deterministically

use recovery_engine::cancellation::{CancelHandle, CancelToken};
use recovery_engine::circuit_breaker::CircuitState;
use recovery_engine::classifier::{ErrorClassifier, OperationContext};
use recovery_engine::config::{EngineConfig, RecoveryConfiguration};
use recovery_engine::error::AttemptError;
use recovery_engine::policy::{RecoveryPolicy, RecoveryStrategy};
use recovery_engine::recovery::{Invocation, RecoveryEngine, RecoveryExecutor, RecoveryResult};
use recovery_engine::taxonomy::{ErrorDetails, ErrorKind};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use RecoveryStrategy::*;

fn config() -> RecoveryConfiguration {
    RecoveryConfiguration::default()
        .with_max_retry_attempts(3)
        .with_base_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(100))
        .with_backoff_multiplier(2.0)
        .with_jitter(false)
}

fn executor_with(kind: ErrorKind, strategies: Vec<RecoveryStrategy>) -> RecoveryExecutor {
    RecoveryExecutor::new(config(), RecoveryPolicy::empty().with(kind, strategies)).unwrap()
}

fn failure(kind: ErrorKind) -> ErrorDetails {
    ErrorDetails::builder(kind, "dependency failed").build()
}

fn strategies<T>(result: &RecoveryResult<T>) -> Vec<(RecoveryStrategy, bool)> {
    result
        .attempts()
        .iter()
        .map(|attempt| (attempt.strategy, attempt.success))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_makes_exactly_max_attempts() {
    let executor = executor_with(ErrorKind::NetworkError, vec![Retry, Abort]);
    let calls = AtomicU32::new(0);

    let result: RecoveryResult<()> = executor
        .execute(
            &CancelToken::never(),
            &failure(ErrorKind::NetworkError),
            Invocation::new("inventory", ()),
            |_: ()| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("connection refused")) }
            },
        )
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!result.is_success());
    assert_eq!(result.strategy_used(), None);
    assert_eq!(
        strategies(&result),
        vec![(Retry, false), (Retry, false), (Retry, false), (Abort, false)]
    );
    assert_eq!(result.attempts()[3].error, Some(AttemptError::Aborted));
    assert_eq!(
        result.attempts()[0].error,
        Some(AttemptError::Operation {
            message: "connection refused".to_string()
        })
    );
    // exhausted budgets start over for the next failure
    assert_eq!(executor.retry_count("inventory"), 0);
}

fn retry_attempts<T>(result: &RecoveryResult<T>) -> usize {
    result
        .attempts()
        .iter()
        .filter(|attempt| attempt.strategy == Retry)
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_retry_budget() {
    let executor = executor_with(ErrorKind::NetworkError, vec![Retry, Abort]);
    let calls = AtomicU32::new(0);
    let details = failure(ErrorKind::NetworkError);
    let never = CancelToken::never();
    let operation = |_: ()| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(anyhow::anyhow!("connection reset")) }
    };

    let (first, second) = tokio::join!(
        executor.execute(&never, &details, Invocation::new("shared", ()), operation),
        executor.execute(&never, &details, Invocation::new("shared", ()), operation),
    );

    assert!(!first.is_success());
    assert!(!second.is_success());
    assert_eq!(retry_attempts(&first) + retry_attempts(&second), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(executor.retry_count("shared"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_keys_do_not_share_retry_budget() {
    let executor = executor_with(ErrorKind::NetworkError, vec![Retry, Abort]);
    let details = failure(ErrorKind::NetworkError);
    let never = CancelToken::never();
    let operation = |_: ()| async { Err::<(), _>(anyhow::anyhow!("connection reset")) };

    let (billing, search) = tokio::join!(
        executor.execute(&never, &details, Invocation::new("billing", ()), operation),
        executor.execute(&never, &details, Invocation::new("search", ()), operation),
    );

    assert_eq!(retry_attempts(&billing), 3);
    assert_eq!(retry_attempts(&search), 3);
    assert_eq!(executor.retry_count("billing"), 0);
    assert_eq!(executor.retry_count("search"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_recorded_per_attempt() {
    let executor = executor_with(ErrorKind::Timeout, vec![Retry]);
    let started = tokio::time::Instant::now();

    let result: RecoveryResult<()> = executor
        .execute(
            &CancelToken::never(),
            &failure(ErrorKind::Timeout),
            Invocation::new("slow", ()),
            |_: ()| async { Err(anyhow::anyhow!("timed out")) },
        )
        .await;

    let delays: Vec<_> = result
        .attempts()
        .iter()
        .map(|attempt| attempt.metadata["delay_ms"].clone())
        .collect();
    assert_eq!(delays, vec![json!(10), json!(20), json!(40)]);
    assert!(started.elapsed() >= Duration::from_millis(70));
}

#[tokio::test(start_paused = true)]
async fn test_first_success_short_circuits_remaining_strategies() {
    let executor = executor_with(ErrorKind::NetworkError, vec![Retry, Fallback, Abort]);
    let fallback_calls = std::sync::Arc::new(AtomicU32::new(0));
    let counter = fallback_calls.clone();
    executor.register_fallback("profile", move |_: u32| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, anyhow::Error>("cached".to_string()) }
    });

    let result = executor
        .execute(
            &CancelToken::never(),
            &failure(ErrorKind::NetworkError),
            Invocation::new("profile", 7u32),
            |id: u32| async move { Ok::<_, anyhow::Error>(format!("live-{id}")) },
        )
        .await;

    assert!(result.is_success());
    assert_eq!(result.strategy_used(), Some(Retry));
    assert_eq!(result.value().map(String::as_str), Some("live-7"));
    assert_eq!(strategies(&result), vec![(Retry, true)]);
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_recovers_through_degradation() {
    let policy = RecoveryPolicy::default().with(ErrorKind::Timeout, vec![Retry, GracefulDegradation]);
    let config = config().with_max_retry_attempts(2);
    let engine = RecoveryEngine::new(
        ErrorClassifier::new(),
        RecoveryExecutor::new(config, policy).unwrap(),
    );
    let calls = AtomicU32::new(0);

    let result = engine
        .run(
            &CancelToken::never(),
            &OperationContext::new("search_catalog").with_parameter("page_size", 50),
            Invocation::new("search", 50u32).with_degraded_args(5),
            |page_size: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if page_size > 10 {
                        Err(anyhow::anyhow!("search request timed out"))
                    } else {
                        Ok(page_size)
                    }
                }
            },
        )
        .await;

    assert!(result.is_success());
    assert_eq!(result.strategy_used(), Some(GracefulDegradation));
    assert_eq!(result.value(), Some(&5));
    assert_eq!(
        strategies(&result),
        vec![(Retry, false), (Retry, false), (GracefulDegradation, true)]
    );
    assert_eq!(result.attempts()[0].metadata["delay_ms"], json!(10));
    assert_eq!(result.attempts()[1].metadata["delay_ms"], json!(20));
    assert_eq!(result.attempts()[2].metadata["degraded"], json!(true));
    // initial call, two retries, one degraded call
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let details = result.error_details().unwrap();
    assert_eq!(details.kind(), ErrorKind::Timeout);
    assert_eq!(details.context()["page_size"], json!(50));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff_stops_recovery() {
    let executor = executor_with(ErrorKind::Timeout, vec![Retry, GracefulDegradation, Abort]);
    let cancel = CancelToken::never().with_timeout(Duration::from_millis(15));

    let result: RecoveryResult<u32> = executor
        .execute(
            &cancel,
            &failure(ErrorKind::Timeout),
            Invocation::new("report", 100u32).with_degraded_args(1),
            |_: u32| async { Err(anyhow::anyhow!("timed out")) },
        )
        .await;

    assert!(!result.is_success());
    assert!(result.was_cancelled());
    assert_eq!(strategies(&result), vec![(Retry, false), (Retry, false)]);
    assert_eq!(result.attempts()[1].error, Some(AttemptError::Cancelled));
    assert!(result.attempts_for(GracefulDegradation).next().is_none());
}

#[tokio::test]
async fn test_cancelled_before_start_records_single_attempt() {
    let executor = executor_with(ErrorKind::NetworkError, vec![Retry, Fallback, Abort]);
    let handle = CancelHandle::new();
    let token = handle.token();
    handle.cancel();
    let calls = AtomicU32::new(0);

    let result: RecoveryResult<()> = executor
        .execute(
            &token,
            &failure(ErrorKind::NetworkError),
            Invocation::new("sync", ()),
            |_: ()| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;

    assert!(result.was_cancelled());
    assert_eq!(strategies(&result), vec![(Retry, false)]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fallback_registry() {
    let executor = executor_with(ErrorKind::NotFound, vec![Fallback, Abort]);
    executor.register_fallback("avatar", |user: String| async move {
        Ok::<_, anyhow::Error>(format!("default-avatar-for-{user}"))
    });

    let recovered = executor
        .execute(
            &CancelToken::never(),
            &failure(ErrorKind::NotFound),
            Invocation::new("avatar", "bob".to_string()),
            |_: String| async { Err::<String, _>(anyhow::anyhow!("not found")) },
        )
        .await;
    assert_eq!(recovered.strategy_used(), Some(Fallback));
    assert_eq!(
        recovered.into_value().as_deref(),
        Some("default-avatar-for-bob")
    );

    // registered for (String -> String), invoked with (u32 -> String)
    let mismatched: RecoveryResult<String> = executor
        .execute(
            &CancelToken::never(),
            &failure(ErrorKind::NotFound),
            Invocation::new("avatar", 42u32),
            |_: u32| async { Err(anyhow::anyhow!("not found")) },
        )
        .await;
    assert_eq!(
        mismatched.attempts()[0].error,
        Some(AttemptError::FallbackTypeMismatch {
            key: "avatar".to_string()
        })
    );

    assert!(executor.unregister_fallback("avatar"));
    let missing: RecoveryResult<String> = executor
        .execute(
            &CancelToken::never(),
            &failure(ErrorKind::NotFound),
            Invocation::new("avatar", "bob".to_string()),
            |_: String| async { Err(anyhow::anyhow!("not found")) },
        )
        .await;
    assert!(!missing.is_success());
    assert_eq!(
        missing.attempts()[0].error,
        Some(AttemptError::NoFallbackRegistered {
            key: "avatar".to_string()
        })
    );
}

#[tokio::test]
async fn test_escalation_is_not_success() {
    let executor = RecoveryExecutor::new(config(), RecoveryPolicy::default()).unwrap();

    let result: RecoveryResult<()> = executor
        .execute(
            &CancelToken::never(),
            &failure(ErrorKind::DiskFull),
            Invocation::new("export", ()),
            |_: ()| async { Ok(()) },
        )
        .await;

    assert!(!result.is_success());
    assert!(result.requires_intervention());
    assert_eq!(strategies(&result), vec![(Escalation, true), (Abort, false)]);
    assert_eq!(result.attempts()[0].metadata["escalated"], json!(true));
    assert!(result
        .user_facing_message()
        .contains("Manual intervention has been requested"));
}

async fn call_billing(executor: &RecoveryExecutor, calls: &AtomicU32) -> RecoveryResult<()> {
    executor
        .execute(
            &CancelToken::never(),
            &failure(ErrorKind::ExternalServiceError),
            Invocation::new("billing", ()),
            |_: ()| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("503 service unavailable")) }
            },
        )
        .await
}

#[tokio::test]
async fn test_circuit_breaker_strategy_opens_and_rejects() {
    let config = config().with_circuit_breaker_threshold(1);
    let executor = RecoveryExecutor::new(
        config,
        RecoveryPolicy::empty().with(ErrorKind::ExternalServiceError, vec![CircuitBreaker, Abort]),
    )
    .unwrap();
    let calls = AtomicU32::new(0);

    let first = call_billing(&executor, &calls).await;
    assert_eq!(strategies(&first), vec![(CircuitBreaker, false), (Abort, false)]);
    assert_eq!(executor.circuit_breaker_state("billing"), Some(CircuitState::Open));

    let second = call_billing(&executor, &calls).await;
    assert!(second.attempts()[0]
        .error
        .as_ref()
        .is_some_and(AttemptError::is_circuit_open));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let snapshot = executor.circuit_breaker_snapshot("billing").unwrap();
    assert_eq!(snapshot.failure_count, 1);

    assert!(executor.reset_circuit_breaker("billing"));
    assert_eq!(executor.circuit_breaker_state("billing"), None);
}

#[tokio::test]
async fn test_engine_first_try_success_skips_recovery() {
    let engine = EngineConfig::default().build_engine().unwrap();

    let result = engine
        .run(
            &CancelToken::never(),
            &OperationContext::new("ping"),
            Invocation::new("ping", ()),
            |_: ()| async { Ok::<_, anyhow::Error>("pong") },
        )
        .await;

    assert!(result.is_success());
    assert_eq!(result.strategy_used(), None);
    assert!(result.attempts().is_empty());
    assert!(result.error_details().is_none());
}

#[tokio::test]
async fn test_engine_unmapped_kind_aborts_with_details() {
    let engine = EngineConfig::default().build_engine().unwrap();

    let result = engine
        .run(
            &CancelToken::never(),
            &OperationContext::new("create_user"),
            Invocation::new("users", ()),
            |_: ()| async { Err::<(), _>(anyhow::anyhow!("missing required field 'email'")) },
        )
        .await;

    assert!(!result.is_success());
    assert_eq!(strategies(&result), vec![(Abort, false)]);
    let err = result.into_result().unwrap_err();
    assert_eq!(
        err.details.map(|d| d.kind()),
        Some(ErrorKind::MissingParameter)
    );
}
