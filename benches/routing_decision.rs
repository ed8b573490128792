use criterion::{black_box, criterion_group, criterion_main, Criterion};
use heimdall::auth::Headers;
use heimdall::{app, decide, AppConfig, PluginState, RotationConfig, RouteRequest, RouterConfig};
use reqwest::Client;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

fn bench_config() -> AppConfig {
    let mut router = RouterConfig::default();
    // Benches measure the pipeline, not deadline pressure.
    router.timeout_ms = 1_000;
    AppConfig {
        router,
        log_file: None,
        log_stdout: false,
        log_sample_n: None,
        rotation: RotationConfig {
            max_bytes: None,
            keep: 1,
            compress: false,
        },
    }
}

fn bench_artifact() -> heimdall::artifact::Artifact {
    let models = [
        "openai/gpt-5-nano",
        "google/gemini-2.5-flash-lite",
        "openai/gpt-5-mini",
        "anthropic/claude-haiku-4-5",
        "google/gemini-2.5-flash",
        "anthropic/claude-sonnet-4-5",
        "openai/gpt-5",
        "google/gemini-2.5-pro",
    ];
    let centroid_texts = [
        "summarize this document",
        "write a rust function",
        "plan a trip itinerary",
        "prove this identity",
    ];
    let centroids: Vec<Vec<f32>> = centroid_texts
        .iter()
        .map(|t| heimdall::features::fallback_embedding(t))
        .collect();
    let mut qhat = serde_json::Map::new();
    let mut chat = serde_json::Map::new();
    for (i, m) in models.iter().enumerate() {
        let base = 0.4 + (i as f64) * 0.05;
        qhat.insert(
            m.to_string(),
            json!([base, base + 0.1, base - 0.1, base + 0.05]),
        );
        chat.insert(m.to_string(), json!(0.1 + (i as f64) * 0.08));
    }
    let doc = json!({
        "version": "bench-1",
        "alpha": 0.6,
        "thresholds": {"cheap": 0.6, "hard": 0.5},
        "penalties": {"latency_sd": 0.1, "ctx_over_80pct": 0.5},
        "qhat": qhat,
        "chat": chat,
        "centroids": centroids,
        "gbdt": {
            "trees": [{
                "nodes": [
                    {"feature": 0, "threshold": 5.0, "left": 1, "right": 2},
                    {"leaf": [2.0, 0.0, -2.0]},
                    {"leaf": [-2.0, 0.5, 1.5]}
                ]
            }]
        }
    });
    serde_json::from_value(doc).unwrap()
}

fn request(text: &str) -> RouteRequest {
    serde_json::from_value(json!({
        "messages": [{"role": "user", "content": text}]
    }))
    .unwrap()
}

fn bench_scenarios(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    // Direct pipeline benches: fresh state per case, artifact pre-published.
    let cold_state = PluginState::build({
        let mut cfg = bench_config();
        cfg.router.enable_caching = false;
        cfg
    })
    .unwrap();
    cold_state.artifacts.publish(bench_artifact());
    let prompts: Vec<RouteRequest> = (0..64)
        .map(|i| request(&format!("explain topic number {} in two sentences", i)))
        .collect();
    let mut idx = 0usize;
    c.bench_function("decide_uncached", |b| {
        b.iter(|| {
            let req = &prompts[idx % prompts.len()];
            idx += 1;
            let out = rt.block_on(decide(&cold_state, req, &Headers::new()));
            black_box(out.decision.model);
        })
    });

    let warm_state = PluginState::build(bench_config()).unwrap();
    warm_state.artifacts.publish(bench_artifact());
    let warm_req = request("what is 2+2");
    rt.block_on(decide(&warm_state, &warm_req, &Headers::new()));
    c.bench_function("decide_cache_hit", |b| {
        b.iter(|| {
            let out = rt.block_on(decide(&warm_state, &warm_req, &Headers::new()));
            black_box(out.cache_hit);
        })
    });

    let degraded_state = PluginState::build({
        let mut cfg = bench_config();
        cfg.router.enable_caching = false;
        cfg
    })
    .unwrap();
    let degraded_req = request("quick question about dates");
    c.bench_function("decide_degraded_no_artifact", |b| {
        b.iter(|| {
            let out = rt.block_on(decide(&degraded_state, &degraded_req, &Headers::new()));
            black_box(out.decision.degraded);
        })
    });

    // Full HTTP round-trip through the pre-hook endpoint.
    let hook_url = rt.block_on(async {
        let state = PluginState::build(bench_config()).unwrap();
        state.artifacts.publish(bench_artifact());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1/hook/pre", addr)
    });
    let client = Client::new();
    let body = json!({"messages": [{"role": "user", "content": "what is 2+2"}]});
    c.bench_function("hook_http_round_trip", |b| {
        b.iter_custom(|iters| {
            use std::time::Instant;
            let start = Instant::now();
            for _ in 0..iters {
                rt.block_on(async {
                    let resp = client
                        .post(&hook_url)
                        .header("Authorization", "Bearer sk-bench")
                        .json(&body)
                        .send()
                        .await
                        .unwrap();
                    black_box(resp.status());
                });
            }
            start.elapsed()
        })
    });
}

criterion_group!(routing_decision_group, bench_scenarios);
criterion_main!(routing_decision_group);
