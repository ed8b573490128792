mod common;

use common::{base_config, hook_body, post_hook, spawn_app};
use heimdall::PluginState;

#[tokio::test]
async fn metrics_exposition_covers_the_routing_surface() {
    let mut cfg = base_config();
    cfg.router.timeout_ms = 500;
    let state = PluginState::build(cfg).unwrap();
    let (addr, _handle) = spawn_app(state).await;

    post_hook(&addr, &hook_body("what is 2+2")).await;
    post_hook(&addr, &hook_body("what is 2+2")).await;

    let text = reqwest::Client::new()
        .get(format!("{}/metrics", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(text.contains("heimdall_requests_total 2"));
    assert!(text.contains("heimdall_cache_hits_total 1"));
    assert!(text.contains("heimdall_cache_entries 1"));
    // No artifact published: degraded decisions count as errors.
    assert!(text.contains("heimdall_errors_total 2"));
    assert!(text.contains("heimdall_artifact_info{version=\"\"} 1"));
    assert!(text.contains("heimdall_circuit_state{breaker=\"embedding\",state=\"closed\"} 1"));
    assert!(text.contains("heimdall_circuit_state{breaker=\"artifact\",state=\"closed\"} 1"));
    assert!(text.contains("heimdall_request_latency_us_count 2"));
    assert!(text.contains("heimdall_latency_p50_us"));
    assert!(text.contains("heimdall_latency_p99_us"));
    assert!(text.contains("heimdall_build_info{version="));
    assert!(text.contains("heimdall_process_uptime_seconds"));
}

#[tokio::test]
async fn healthz_reports_budget_and_artifact_state() {
    let mut cfg = base_config();
    cfg.router.timeout_ms = 40;
    let state = PluginState::build(cfg).unwrap();
    let (addr, _handle) = spawn_app(state).await;

    let v: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/healthz", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(v.get("status").and_then(|s| s.as_str()), Some("ok"));
    assert_eq!(v.get("budgetMs").and_then(|b| b.as_u64()), Some(40));
    assert_eq!(v.get("artifactVersion").and_then(|a| a.as_str()), Some(""));
    assert!(v.get("artifactAgeSeconds").unwrap().is_null());
}
