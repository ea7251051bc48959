//! Resilience layer: breaker, rate limiter and executor composed through the
//! public API, on a paused clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stream_relay::resilience::{
    CircuitBreakerConfig, CircuitPhase, ExecutorConfig, RateLimiterConfig, ResilienceState,
    ResilientExecutor, RetryPolicy,
};
use stream_relay::types::Recipient;
use stream_relay::{Error, ErrorKind};
use tokio::time::Instant;

fn no_retry_generation(state: &Arc<ResilienceState>) -> ResilientExecutor {
    let cfg = ExecutorConfig::generation()
        .with_retry(RetryPolicy::new().with_max_retries(0).with_max_jitter(Duration::ZERO));
    ResilientExecutor::new(cfg, Arc::clone(state))
}

#[tokio::test(start_paused = true)]
async fn test_third_failure_opens_and_fourth_call_fails_fast() {
    let state = Arc::new(ResilienceState::default());
    let exec = no_retry_generation(&state);
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let err = exec
            .execute(None, "generate", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::transient("502 bad gateway"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientUpstream);
    }
    assert_eq!(state.breakers.phase("generation"), CircuitPhase::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    let err = exec
        .execute(None, "generate", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_runs_exactly_one_probe() {
    let state = Arc::new(ResilienceState::default());
    let exec = no_retry_generation(&state);
    for _ in 0..3 {
        let _ = exec
            .execute(None, "generate", || async {
                Err::<(), _>(Error::transient("timeout"))
            })
            .await;
    }

    tokio::time::advance(Duration::from_secs(61)).await;
    let calls = AtomicU32::new(0);
    let out = exec
        .execute(None, "generate", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>("ok")
        })
        .await
        .unwrap();
    assert_eq!(out.completed(), Some("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let snap = state.breakers.snapshot("generation");
    assert_eq!(snap.phase, CircuitPhase::Closed);
    assert_eq!(snap.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_circuit() {
    let state = Arc::new(ResilienceState::new(
        RateLimiterConfig::default(),
        CircuitBreakerConfig::new().with_cooldown(Duration::from_secs(10)),
    ));
    let exec = no_retry_generation(&state);
    for _ in 0..3 {
        let _ = exec
            .execute(None, "generate", || async { Err::<(), _>(Error::transient("x")) })
            .await;
    }
    tokio::time::advance(Duration::from_secs(11)).await;
    let _ = exec
        .execute(None, "generate", || async { Err::<(), _>(Error::transient("still down")) })
        .await;
    assert_eq!(state.breakers.phase("generation"), CircuitPhase::Open);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_sleeps_once_and_keeps_budget() {
    let state = Arc::new(ResilienceState::default());
    let cfg = ExecutorConfig::channel()
        .with_retry(RetryPolicy::new().with_max_retries(0).with_max_jitter(Duration::ZERO));
    let exec = ResilientExecutor::new(cfg, Arc::clone(&state));
    let chat = Recipient::new("99");
    let calls = AtomicU32::new(0);

    let start = Instant::now();
    let out = exec
        .execute(Some(&chat), "edit", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::RetryAfter { seconds: 5 })
            } else {
                Ok("edited")
            }
        })
        .await
        .unwrap();

    assert_eq!(out.completed(), Some("edited"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(start.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_penalizes_following_calls() {
    let state = Arc::new(ResilienceState::new(
        RateLimiterConfig::new().with_min_interval(Duration::ZERO),
        CircuitBreakerConfig::default(),
    ));
    let exec = ResilientExecutor::new(ExecutorConfig::channel(), Arc::clone(&state));
    let chat = Recipient::new("5");
    let calls = AtomicU32::new(0);
    exec.execute(Some(&chat), "send", || async {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Error::RetryAfter { seconds: 2 })
        } else {
            Ok(())
        }
    })
    .await
    .unwrap();

    let snap = state.rate_limiter.snapshot(&chat.rate_key("channel")).await;
    assert!(snap.backoff_remaining.is_none());
    assert_eq!(snap.history_len, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_budget() {
    let state = Arc::new(ResilienceState::default());
    let cfg = ExecutorConfig::new("upload").with_retry(
        RetryPolicy::new()
            .with_max_retries(2)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_jitter(Duration::ZERO),
    );
    let exec = ResilientExecutor::new(cfg, state);
    let calls = AtomicU32::new(0);

    let start = Instant::now();
    let err = exec
        .execute(None, "upload", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::transient("connection reset"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientUpstream);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 1s + 2s of backoff between the three attempts.
    assert_eq!(start.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_is_not_retried() {
    let state = Arc::new(ResilienceState::default());
    let exec = ResilientExecutor::new(ExecutorConfig::generation(), Arc::clone(&state));
    let calls = AtomicU32::new(0);
    let err = exec
        .execute(None, "generate", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::permanent("400 malformed request"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermanentUpstream);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.breakers.snapshot("generation").failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_not_modified_is_success() {
    let exec = ResilientExecutor::new(ExecutorConfig::channel(), Arc::new(ResilienceState::default()));
    let out = exec
        .execute(Some(&Recipient::new("1")), "edit", || async {
            Err::<(), _>(Error::NotModified)
        })
        .await
        .unwrap();
    assert!(out.is_unchanged());
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_edit_resets_failure_count() {
    let state = Arc::new(ResilienceState::default());
    let exec = no_retry_generation(&state);
    for _ in 0..2 {
        let _ = exec
            .execute(None, "generate", || async { Err::<(), _>(Error::transient("timeout")) })
            .await;
    }
    assert_eq!(state.breakers.snapshot("generation").failure_count, 2);

    let out = exec
        .execute(None, "generate", || async { Err::<(), _>(Error::NotModified) })
        .await
        .unwrap();
    assert!(out.is_unchanged());
    assert_eq!(state.breakers.snapshot("generation").failure_count, 0);

    let _ = exec
        .execute(None, "generate", || async { Err::<(), _>(Error::transient("timeout")) })
        .await;
    assert_eq!(state.breakers.phase("generation"), CircuitPhase::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_edit_closes_half_open_circuit() {
    let state = Arc::new(ResilienceState::default());
    let exec = no_retry_generation(&state);
    for _ in 0..3 {
        let _ = exec
            .execute(None, "generate", || async { Err::<(), _>(Error::transient("timeout")) })
            .await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    exec.execute(None, "generate", || async { Err::<(), _>(Error::NotModified) })
        .await
        .unwrap();
    assert_eq!(state.breakers.phase("generation"), CircuitPhase::Closed);
    assert!(exec
        .execute(None, "generate", || async { Ok::<_, Error>(()) })
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_while_half_open_closes_circuit() {
    let state = Arc::new(ResilienceState::default());
    let exec = no_retry_generation(&state);
    for _ in 0..3 {
        let _ = exec
            .execute(None, "generate", || async { Err::<(), _>(Error::transient("timeout")) })
            .await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    let err = exec
        .execute(None, "generate", || async {
            Err::<(), _>(Error::permanent("400 malformed request"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermanentUpstream);
    assert_eq!(state.breakers.phase("generation"), CircuitPhase::Closed);

    tokio::time::advance(Duration::from_secs(30)).await;
    let calls = AtomicU32::new(0);
    let out = exec
        .execute(None, "generate", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>("ok")
        })
        .await
        .unwrap();
    assert_eq!(out.completed(), Some("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.breakers.snapshot("generation").failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_while_half_open_keeps_failure_count() {
    let state = Arc::new(ResilienceState::default());
    let exec = no_retry_generation(&state);
    for _ in 0..3 {
        let _ = exec
            .execute(None, "generate", || async { Err::<(), _>(Error::transient("timeout")) })
            .await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;
    let _ = exec
        .execute(None, "generate", || async { Err::<(), _>(Error::permanent("bad request")) })
        .await;

    let _ = exec
        .execute(None, "generate", || async { Err::<(), _>(Error::transient("timeout")) })
        .await;
    assert_eq!(state.breakers.phase("generation"), CircuitPhase::Open);
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_acquires_keep_min_spacing() {
    let state = ResilienceState::default();
    let min = state.rate_limiter.config().min_interval;
    for _ in 0..5 {
        state.rate_limiter.acquire("channel:42").await;
    }
    let history = state.rate_limiter.history("channel:42").await;
    assert_eq!(history.len(), 5);
    for pair in history.windows(2) {
        assert!(pair[1] - pair[0] >= min);
    }
}

#[tokio::test(start_paused = true)]
async fn test_recipients_are_paced_independently() {
    let state = Arc::new(ResilienceState::default());
    let a = {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            for _ in 0..3 {
                state.rate_limiter.acquire("channel:a").await;
            }
        })
    };
    let start = Instant::now();
    state.rate_limiter.acquire("channel:b").await;
    assert_eq!(start.elapsed(), Duration::ZERO);
    a.await.unwrap();
    assert_eq!(state.rate_limiter.tracked_keys(), 2);
}
