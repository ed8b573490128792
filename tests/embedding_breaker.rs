mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use common::{base_config, hook_body, post_hook, spawn_app, spawn_router};
use heimdall::PluginState;

// An embedding service that always fails trips its breaker; later requests
// use the deterministic fallback without attempting HTTP at all.
#[tokio::test]
async fn failing_embedding_service_opens_the_breaker() {
    let hits = Arc::new(AtomicU64::new(0));
    let hits_for_route = hits.clone();
    let router = axum::Router::new().route(
        "/embed",
        axum::routing::post(move || {
            let hits = hits_for_route.clone();
            async move {
                hits.fetch_add(1, Ordering::Relaxed);
                StatusCode::SERVICE_UNAVAILABLE
            }
        }),
    );
    let (upstream, _upstream_handle) = spawn_router(router).await;

    let mut cfg = base_config();
    cfg.router.timeout_ms = 500;
    cfg.router.embedding_timeout_ms = 100;
    cfg.router.embedding_url = Some(format!("{}/embed", upstream));
    cfg.router.breakers.failure_threshold = 2;
    cfg.router.breakers.cooldown_ms = 60_000;
    // Distinct prompts so the decision cache does not absorb the calls.
    let state = PluginState::build(cfg).unwrap();
    let breakers = state.breakers.clone();
    let (addr, _handle) = spawn_app(state).await;

    for i in 0..4 {
        let v = post_hook(&addr, &hook_body(&format!("request number {}", i))).await;
        // Every decision still ships, flagged degraded.
        let decision = v.get("heimdall_decision").unwrap();
        assert_eq!(decision.get("degraded"), Some(&serde_json::json!(true)));
    }

    // Two failures tripped the breaker; the last two requests short-circuited.
    assert_eq!(hits.load(Ordering::Relaxed), 2);
    assert_eq!(breakers.embedding.state_name(), "open");

    let metrics = reqwest::Client::new()
        .get(format!("{}/metrics", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("heimdall_circuit_state{breaker=\"embedding\",state=\"open\"} 1"));
    assert!(metrics.contains("heimdall_circuit_trips_total{breaker=\"embedding\"} 1"));
}
