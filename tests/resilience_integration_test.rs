//! End-to-end resilience tests: breaker tripping through the guarded tool
//! path, wire-visible error payloads, degradation gating, and coordinated
//! recovery.

use std::time::Duration;

use selector_memory::config::MemoryConfig;
use selector_memory::context::SystemContext;
use selector_memory::error::{ErrorKind, MemoryError};
use selector_memory::resilience::{BreakerState, CircuitBreaker, DegradationLevel};
use serde_json::json;

fn fast_config(root: &str) -> MemoryConfig {
    let mut config = MemoryConfig::rooted_at(root);
    config.breaker.initial_backoff_delay = Duration::from_millis(50);
    config.breaker.max_backoff_delay = Duration::from_millis(400);
    config
}

fn crash(tool: &str) -> MemoryError {
    MemoryError::Execution {
        tool: tool.to_string(),
        message: "browser crash detected".to_string(),
        kind: ErrorKind::classify("browser crash detected"),
    }
}

#[tokio::test]
async fn test_breaker_opens_and_recovers_through_tool_path() {
    let ctx = SystemContext::initialize_in_memory(fast_config("/tmp/sm-resilience-1"))
        .await
        .unwrap();
    ctx.registry.load_all().await;

    // repeated browser crashes trip the breaker
    for _ in 0..5 {
        let _ = ctx
            .execute_tool::<(), _, _>(
                "mcp_browser_click",
                json!({"selector": "button#add"}),
                |_| async { Err(crash("mcp_browser_click")) },
            )
            .await;
    }
    assert_eq!(ctx.breaker.state(), BreakerState::Open);

    // rejected immediately, with the wire-visible payload
    let rejected = ctx
        .execute_tool::<(), _, _>(
            "mcp_browser_click",
            json!({"selector": "button#add"}),
            |_| async { Ok(()) },
        )
        .await
        .unwrap_err();
    assert!(rejected.can_retry);
    assert!(rejected.estimated_recovery.is_some());
    assert!(rejected.degradation_level.is_some());

    // past the backoff deadline one successful probe closes the breaker
    let backoff = ctx.breaker.snapshot().backoff_delay_ms;
    tokio::time::sleep(Duration::from_millis(backoff + 30)).await;
    ctx.execute_tool(
        "mcp_browser_click",
        json!({"selector": "button#add"}),
        |_| async { Ok(()) },
    )
    .await
    .unwrap();
    assert_eq!(ctx.breaker.state(), BreakerState::Closed);
    assert_eq!(
        ctx.breaker.snapshot().backoff_delay_ms,
        50,
        "backoff resets to initial on recovery"
    );
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_element_not_found_does_not_open_breaker() {
    let ctx = SystemContext::initialize_in_memory(fast_config("/tmp/sm-resilience-2"))
        .await
        .unwrap();
    ctx.registry.load_all().await;

    for _ in 0..10 {
        let _ = ctx
            .execute_tool::<(), _, _>(
                "mcp_browser_click",
                json!({"selector": "#gone"}),
                |_| async {
                    Err(MemoryError::Execution {
                        tool: "mcp_browser_click".to_string(),
                        message: "element not found: #gone".to_string(),
                        kind: ErrorKind::classify("element not found: #gone"),
                    })
                },
            )
            .await;
    }
    assert_eq!(ctx.breaker.state(), BreakerState::Closed);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_degradation_follows_breaker_and_recovery_restores() {
    let ctx = SystemContext::initialize_in_memory(fast_config("/tmp/sm-resilience-3"))
        .await
        .unwrap();
    ctx.registry.load_all().await;

    let full_tool_count = ctx.registry.list_tools().await.len();

    for _ in 0..5 {
        let _ = ctx
            .execute_tool::<(), _, _>(
                "mcp_browser_click",
                json!({"selector": "button"}),
                |_| async { Err(crash("mcp_browser_click")) },
            )
            .await;
    }
    assert_eq!(ctx.breaker.state(), BreakerState::Open);

    // the next health-check pass propagates breaker state into the level
    ctx.run_health_check().await;
    assert_eq!(ctx.degradation.current(), DegradationLevel::ReadOnly);

    // write-to-page tools disappear from enumeration
    let reduced = ctx.registry.list_tools().await;
    assert!(reduced.len() < full_tool_count);
    assert!(reduced.iter().all(|t| t.name != "mcp_browser_click"));

    // rejected calls carry the active level in the error payload
    let gated = ctx
        .execute_tool::<(), _, _>(
            "mcp_browser_type",
            json!({"selector": "input", "text": "x"}),
            |_| async { Ok(()) },
        )
        .await
        .unwrap_err();
    assert_eq!(gated.degradation_level.as_deref(), Some("L3 Read-Only"));

    // coordinated recovery: wait out the backoff, then promote stepwise
    let backoff = ctx.breaker.snapshot().backoff_delay_ms;
    tokio::time::sleep(Duration::from_millis(backoff + 30)).await;
    let report = ctx.attempt_recovery().await;
    assert!(report.any_success);
    assert_eq!(ctx.degradation.current(), DegradationLevel::Simplified);

    let report = ctx.attempt_recovery().await;
    assert!(report.any_success);
    assert_eq!(ctx.degradation.current(), DegradationLevel::Full);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_open_breaker_rejects_before_validation_runs() {
    let ctx = SystemContext::initialize_in_memory(fast_config("/tmp/sm-resilience-5"))
        .await
        .unwrap();
    ctx.registry.load_all().await;

    for _ in 0..5 {
        let _ = ctx
            .execute_tool::<(), _, _>(
                "mcp_browser_click",
                json!({"selector": "button#add"}),
                |_| async { Err(crash("mcp_browser_click")) },
            )
            .await;
    }
    assert_eq!(ctx.breaker.state(), BreakerState::Open);
    let validated_before = ctx.validator.metrics().total_messages;

    // invalid params AND an open circuit: the circuit-open rejection wins,
    // and the validator never sees the record
    let rejected = ctx
        .execute_tool::<(), _, _>("mcp_browser_click", json!({}), |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(rejected.can_retry);
    assert!(rejected.estimated_recovery.is_some());
    assert_eq!(ctx.validator.metrics().total_messages, validated_before);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_validation_failures_never_trip() {
    let ctx = SystemContext::initialize_in_memory(fast_config("/tmp/sm-resilience-4"))
        .await
        .unwrap();
    ctx.registry.load_all().await;

    for _ in 0..10 {
        let err = ctx
            .execute_tool::<(), _, _>("mcp_browser_click", json!({}), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(!err.can_retry);
    }
    assert_eq!(ctx.breaker.state(), BreakerState::Closed);
    assert_eq!(ctx.validator.metrics().invalid_messages, 10);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_breaker_state_survives_restart_without_window() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path().to_str().unwrap());

    {
        let breaker = CircuitBreaker::with_state_file(
            config.breaker.clone(),
            Some(config.breaker_state_path()),
        );
        for _ in 0..3 {
            let _ = breaker
                .execute::<(), _, _>("tool", || async { Err(crash("tool")) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let restored = CircuitBreaker::with_state_file(
        config.breaker.clone(),
        Some(config.breaker_state_path()),
    );
    assert_eq!(restored.state(), BreakerState::Open);
    let snapshot = restored.snapshot();
    // the sliding window is discarded on restore so stale failures cannot
    // dominate recovery
    assert_eq!(snapshot.window_failures, 0);
    assert_eq!(snapshot.window_successes, 0);
}
