#![allow(dead_code)]

use std::collections::HashMap;

use axum::Router;
use heimdall::features::fallback_embedding;
use heimdall::{app, AppConfig, PluginState, RotationConfig, RouterConfig};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::task::JoinHandle;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        self.originals.insert(key.to_string(), std::env::var(key).ok());
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Default app config with telemetry off; tests tweak `.router` as needed.
pub fn base_config() -> AppConfig {
    AppConfig {
        router: RouterConfig::default(),
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

/// Bind the plugin app on an ephemeral port.
pub async fn spawn_app(state: PluginState) -> (String, JoinHandle<()>) {
    spawn_router(app(state)).await
}

/// Bind any router on an ephemeral port (mock upstreams).
pub async fn spawn_router(router: Router) -> (String, JoinHandle<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

/// A tuning artifact whose single stump routes short prompts cheap and long
/// prompts hard; `openai/gpt-5-nano` carries the best quality row so the
/// cheap winner is deterministic.
pub fn artifact_json(version: &str) -> serde_json::Value {
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
    let mut qhat = serde_json::Map::new();
    let mut chat = serde_json::Map::new();
    for m in models {
        let q = if m == "openai/gpt-5-nano" { 0.9 } else { 0.5 };
        qhat.insert(m.to_string(), serde_json::json!([q]));
        chat.insert(m.to_string(), serde_json::json!(0.2));
    }
    serde_json::json!({
        "version": version,
        "alpha": 0.6,
        "thresholds": {"cheap": 0.6, "hard": 0.5},
        "penalties": {"latency_sd": 0.1, "ctx_over_80pct": 0.5},
        "qhat": qhat,
        "chat": chat,
        "centroids": [fallback_embedding("what is 2+2")],
        "gbdt": {
            "trees": [{
                "nodes": [
                    {"feature": 0, "threshold": 5.0, "left": 1, "right": 2},
                    {"leaf": [2.0, 0.0, -2.0]},
                    {"leaf": [-2.0, 0.5, 1.5]}
                ]
            }]
        },
        "featureNames": ["f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9", "f10"]
    })
}

/// Serve a fixed artifact document.
pub async fn spawn_artifact_server(version: &str) -> (String, JoinHandle<()>) {
    let doc = artifact_json(version);
    let router = Router::new().route(
        "/artifact.json",
        axum::routing::get(move || {
            let doc = doc.clone();
            async move { axum::Json(doc) }
        }),
    );
    let (addr, handle) = spawn_router(router).await;
    (format!("{}/artifact.json", addr), handle)
}

/// Poll /healthz until the expected artifact version is live.
pub async fn wait_for_artifact(addr: &str, version: &str) {
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(resp) = client.get(format!("{}/healthz", addr)).send().await {
            if let Ok(v) = resp.json::<serde_json::Value>().await {
                if v.get("artifactVersion").and_then(|v| v.as_str()) == Some(version) {
                    return;
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("artifact {} never became live", version);
}

pub fn hook_body(text: &str) -> serde_json::Value {
    serde_json::json!({
        "messages": [{"role": "user", "content": text}]
    })
}

pub async fn post_hook(addr: &str, body: &serde_json::Value) -> serde_json::Value {
    reqwest::Client::new()
        .post(format!("{}/v1/hook/pre", addr))
        .json(body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}
