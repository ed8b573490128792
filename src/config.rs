//! Typed configuration: a JSON file named by `HEIMDALL_CONFIG` plus a small
//! set of env overrides. Validation failures here are the only fatal errors
//! in the plugin.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::artifact::Thresholds;
use crate::breaker::BreakerConfig;
use crate::bucket::{Bucket, CandidatePools};
use crate::catalog::CatalogConfig;
use crate::error::RouterError;
use crate::scorer::{ExploreParams, ScorerParams};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdSection {
    pub cheap: f64,
    pub hard: f64,
}

impl Default for ThresholdSection {
    fn default() -> Self {
        Self {
            cheap: 0.6,
            hard: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PenaltySection {
    /// λ coefficients. Unset means "use the artifact's values".
    pub latency_sd: Option<f64>,
    #[serde(alias = "ctxOver80Pct")]
    pub ctx_over_80pct: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThinkingDefaults {
    pub gpt5_reasoning_effort: Option<String>,
    pub gemini_thinking_budget: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketDefaultsSection {
    pub mid: ThinkingDefaults,
    pub hard: ThinkingDefaults,
}

impl Default for BucketDefaultsSection {
    fn default() -> Self {
        Self {
            mid: ThinkingDefaults {
                gpt5_reasoning_effort: Some("low".into()),
                gemini_thinking_budget: Some(2_048),
            },
            hard: ThinkingDefaults {
                gpt5_reasoning_effort: Some("high".into()),
                gemini_thinking_budget: Some(16_384),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterSection {
    /// Overrides the artifact's α when set.
    pub alpha: Option<f64>,
    /// Bucket selection thresholds used until an artifact is published.
    pub thresholds: ThresholdSection,
    pub top_p: usize,
    pub penalties: PenaltySection,
    pub bucket_defaults: BucketDefaultsSection,
    pub cheap_candidates: Vec<String>,
    pub mid_candidates: Vec<String>,
    pub hard_candidates: Vec<String>,
    pub default_bucket: Bucket,
    pub default_context_limit: u32,
    pub context_limits: HashMap<String, u32>,
    pub latency_sd: HashMap<String, f64>,
    pub alpha_code_boost: f64,
    pub alpha_cost_relief: f64,
    pub fallback_depth: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            alpha: None,
            thresholds: ThresholdSection::default(),
            top_p: 5,
            penalties: PenaltySection::default(),
            bucket_defaults: BucketDefaultsSection::default(),
            cheap_candidates: vec![
                "openai/gpt-5-nano".into(),
                "google/gemini-2.5-flash-lite".into(),
            ],
            mid_candidates: vec![
                "openai/gpt-5-mini".into(),
                "anthropic/claude-haiku-4-5".into(),
                "google/gemini-2.5-flash".into(),
            ],
            hard_candidates: vec![
                "anthropic/claude-sonnet-4-5".into(),
                "openai/gpt-5".into(),
                "google/gemini-2.5-pro".into(),
            ],
            default_bucket: Bucket::Mid,
            default_context_limit: 128_000,
            context_limits: HashMap::new(),
            latency_sd: HashMap::new(),
            alpha_code_boost: 0.05,
            alpha_cost_relief: 0.0,
            fallback_depth: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogSection {
    pub base_url: Option<String>,
    pub refresh_seconds: u64,
    pub max_retries: u32,
    pub max_entries: usize,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            base_url: None,
            refresh_seconds: 300,
            max_retries: 3,
            max_entries: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TuningSection {
    pub artifact_url: Option<String>,
    pub reload_seconds: u64,
    pub backoff_cap_seconds: u64,
}

impl Default for TuningSection {
    fn default() -> Self {
        Self {
            artifact_url: None,
            reload_seconds: 300,
            backoff_cap_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub half_open_probes: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            half_open_probes: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub router: RouterSection,
    pub catalog: CatalogSection,
    pub tuning: TuningSection,
    pub breakers: BreakerSection,
    /// Pre-hook deadline.
    pub timeout_ms: u64,
    /// Hard-ceiling slack on top of the deadline for the safe-default path.
    pub grace_ms: u64,
    pub cache_ttl_seconds: u64,
    pub max_cache_size: usize,
    pub score_ttl_seconds: u64,
    pub embedding_url: Option<String>,
    pub embedding_timeout_ms: u64,
    pub feature_timeout_ms: u64,
    pub feature_byte_budget: usize,
    pub enable_caching: bool,
    pub enable_auth: bool,
    pub enable_fallbacks: bool,
    pub enable_observability: bool,
    pub enable_exploration: bool,
    pub explore_rate: f64,
    pub explore_top_k: usize,
    pub explore_seed: u64,
    pub max_request_bytes: Option<usize>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            router: RouterSection::default(),
            catalog: CatalogSection::default(),
            tuning: TuningSection::default(),
            breakers: BreakerSection::default(),
            timeout_ms: 25,
            grace_ms: 5,
            cache_ttl_seconds: 300,
            max_cache_size: 10_000,
            score_ttl_seconds: 300,
            embedding_url: None,
            embedding_timeout_ms: 15,
            feature_timeout_ms: 20,
            feature_byte_budget: 32 * 1024,
            enable_caching: true,
            enable_auth: true,
            enable_fallbacks: true,
            enable_observability: false,
            enable_exploration: false,
            explore_rate: 0.1,
            explore_top_k: 3,
            explore_seed: 0,
            max_request_bytes: None,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        let fail = |msg: String| Err(RouterError::ConfigInvalid(msg));
        if let Some(alpha) = self.router.alpha {
            if !(0.0..=1.0).contains(&alpha) {
                return fail(format!("router.alpha {} out of [0,1]", alpha));
            }
        }
        for (name, v) in [
            ("router.thresholds.cheap", self.router.thresholds.cheap),
            ("router.thresholds.hard", self.router.thresholds.hard),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return fail(format!("{} {} out of [0,1]", name, v));
            }
        }
        if self.timeout_ms == 0 {
            return fail("timeoutMs must be positive".into());
        }
        if self.router.top_p == 0 {
            return fail("router.topP must be at least 1".into());
        }
        if self.max_cache_size == 0 {
            return fail("maxCacheSize must be at least 1".into());
        }
        for (name, list) in [
            ("router.cheapCandidates", &self.router.cheap_candidates),
            ("router.midCandidates", &self.router.mid_candidates),
            ("router.hardCandidates", &self.router.hard_candidates),
        ] {
            if list.is_empty() {
                return fail(format!("{} must not be empty", name));
            }
            if let Some(bad) = list.iter().find(|m| !m.contains('/')) {
                return fail(format!("{}: '{}' is not provider/model", name, bad));
            }
        }
        if !(0.0..=1.0).contains(&self.explore_rate) {
            return fail(format!("exploreRate {} out of [0,1]", self.explore_rate));
        }
        if self.explore_top_k == 0 {
            return fail("exploreTopK must be at least 1".into());
        }
        if self.router.default_context_limit == 0 {
            return fail("router.defaultContextLimit must be positive".into());
        }
        Ok(())
    }

    pub fn candidate_pools(&self) -> CandidatePools {
        CandidatePools {
            cheap: self.router.cheap_candidates.clone(),
            mid: self.router.mid_candidates.clone(),
            hard: self.router.hard_candidates.clone(),
            context_limits: self.router.context_limits.clone(),
            default_context_limit: self.router.default_context_limit,
        }
    }

    /// Thresholds used before the first artifact is published.
    pub fn default_thresholds(&self) -> Thresholds {
        Thresholds {
            cheap: self.router.thresholds.cheap,
            hard: self.router.thresholds.hard,
        }
    }

    pub fn scorer_params(&self) -> ScorerParams {
        ScorerParams {
            alpha_override: self.router.alpha,
            alpha_code_boost: self.router.alpha_code_boost,
            alpha_cost_relief: self.router.alpha_cost_relief,
            penalty_latency_sd: self.router.penalties.latency_sd,
            penalty_ctx_over: self.router.penalties.ctx_over_80pct,
            latency_sd: self.router.latency_sd.clone(),
            fallback_depth: self.router.fallback_depth,
            score_ttl: Duration::from_secs(self.score_ttl_seconds),
            explore: ExploreParams {
                enabled: self.enable_exploration,
                rate: self.explore_rate,
                top_k: self.explore_top_k,
                seed: self.explore_seed,
            },
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breakers.failure_threshold,
            cool_down: Duration::from_millis(self.breakers.cooldown_ms),
            half_open_probes: self.breakers.half_open_probes,
        }
    }

    pub fn catalog_config(&self) -> Option<CatalogConfig> {
        self.catalog.base_url.as_ref().map(|base| CatalogConfig {
            base_url: base.clone(),
            ttl: Duration::from_secs(self.catalog.refresh_seconds),
            max_entries: self.catalog.max_entries,
            max_retries: self.catalog.max_retries,
            ..CatalogConfig::default()
        })
    }

    /// Provider thinking parameters attached per bucket; cheap gets none.
    pub fn thinking_for(&self, bucket: Bucket) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        let defaults = match bucket {
            Bucket::Cheap => return map,
            Bucket::Mid => &self.router.bucket_defaults.mid,
            Bucket::Hard => &self.router.bucket_defaults.hard,
        };
        if let Some(effort) = &defaults.gpt5_reasoning_effort {
            map.insert(
                "gpt5_reasoning_effort".into(),
                serde_json::Value::String(effort.clone()),
            );
        }
        if let Some(budget) = defaults.gemini_thinking_budget {
            map.insert("gemini_thinking_budget".into(), budget.into());
        }
        map
    }
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

/// Everything the process needs at startup: the router config plus
/// telemetry plumbing read straight from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub router: RouterConfig,
    pub log_file: Option<String>,
    pub log_stdout: bool,
    pub log_sample_n: Option<u64>,
    pub rotation: RotationConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut router = if let Ok(path) = env::var("HEIMDALL_CONFIG") {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read HEIMDALL_CONFIG '{}'", path))?;
            serde_json::from_str::<RouterConfig>(&content)
                .with_context(|| format!("Failed to parse HEIMDALL_CONFIG '{}'", path))?
        } else {
            RouterConfig::default()
        };

        if let Some(ms) = parse_optional_u64("HEIMDALL_TIMEOUT_MS")? {
            router.timeout_ms = ms;
        }
        if let Ok(url) = env::var("HEIMDALL_ARTIFACT_URL") {
            if !url.trim().is_empty() {
                router.tuning.artifact_url = Some(url);
            }
        }
        if let Ok(url) = env::var("HEIMDALL_CATALOG_URL") {
            if !url.trim().is_empty() {
                router.catalog.base_url = Some(url);
            }
        }
        if let Ok(url) = env::var("HEIMDALL_EMBEDDING_URL") {
            if !url.trim().is_empty() {
                router.embedding_url = Some(url);
            }
        }

        router
            .validate()
            .map_err(|e| anyhow!(e.to_string()))?;

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            router,
            log_file: env::var("HEIMDALL_LOG_FILE").ok(),
            log_stdout: parse_bool_env("HEIMDALL_LOG_STDOUT")?.unwrap_or(false),
            log_sample_n: parse_optional_u64("HEIMDALL_LOG_SAMPLE_N")?.filter(|n| *n > 1),
            rotation,
        })
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn clear_env() {
        for var in [
            "HEIMDALL_CONFIG",
            "HEIMDALL_TIMEOUT_MS",
            "HEIMDALL_ARTIFACT_URL",
            "HEIMDALL_CATALOG_URL",
            "HEIMDALL_EMBEDDING_URL",
            "HEIMDALL_LOG_FILE",
            "HEIMDALL_LOG_STDOUT",
            "HEIMDALL_LOG_SAMPLE_N",
            "LOG_MAX_BYTES",
            "LOG_ROTATE_KEEP",
            "LOG_ROTATE_COMPRESS",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn defaults_validate_and_carry_sane_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.router.timeout_ms, 25);
        assert_eq!(cfg.router.router.top_p, 5);
        assert_eq!(cfg.router.cache_ttl_seconds, 300);
        assert_eq!(cfg.router.router.default_bucket, Bucket::Mid);
        assert!(cfg.router.enable_caching);
        assert!(!cfg.router.enable_exploration);
        assert!(cfg.router.validate().is_ok());
    }

    #[test]
    fn parses_a_full_config_file_with_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let mut temp = NamedTempFile::new().unwrap();
        let config = serde_json::json!({
            "router": {
                "alpha": 0.7,
                "thresholds": {"cheap": 0.65, "hard": 0.4},
                "topP": 3,
                "cheapCandidates": ["p/c1"],
                "midCandidates": ["p/m1", "p/m2"],
                "hardCandidates": ["p/h1"],
                "contextLimits": {"p/c1": 16000},
                "bucketDefaults": {
                    "mid": {"gpt5ReasoningEffort": "minimal", "geminiThinkingBudget": 1024},
                    "hard": {"gpt5ReasoningEffort": "high", "geminiThinkingBudget": 32768}
                }
            },
            "catalog": {"baseUrl": "http://catalog.local", "refreshSeconds": 60},
            "tuning": {"artifactUrl": "http://tuning.local/artifact.json", "reloadSeconds": 30},
            "timeoutMs": 40,
            "cacheTtlSeconds": 120,
            "enableExploration": true,
            "exploreRate": 0.2
        });
        write!(temp, "{}", config).unwrap();

        std::env::set_var("HEIMDALL_CONFIG", temp.path());
        std::env::set_var("HEIMDALL_TIMEOUT_MS", "50");
        std::env::set_var("HEIMDALL_EMBEDDING_URL", "http://embed.local/v1");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.router.router.alpha, Some(0.7));
        assert_eq!(cfg.router.router.top_p, 3);
        // Env override beats the file.
        assert_eq!(cfg.router.timeout_ms, 50);
        assert_eq!(cfg.router.embedding_url.as_deref(), Some("http://embed.local/v1"));
        assert_eq!(cfg.router.tuning.reload_seconds, 30);
        assert_eq!(
            cfg.router.router.context_limits.get("p/c1"),
            Some(&16_000)
        );
        let thinking = cfg.router.thinking_for(Bucket::Mid);
        assert_eq!(
            thinking.get("gpt5_reasoning_effort").and_then(|v| v.as_str()),
            Some("minimal")
        );
        assert!(cfg.router.thinking_for(Bucket::Cheap).is_empty());

        clear_env();
    }

    #[test]
    fn rejects_out_of_range_and_empty_candidate_configs() {
        let mut cfg = RouterConfig::default();
        cfg.router.alpha = Some(1.2);
        assert!(matches!(
            cfg.validate(),
            Err(RouterError::ConfigInvalid(_))
        ));

        let mut cfg = RouterConfig::default();
        cfg.router.cheap_candidates.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = RouterConfig::default();
        cfg.router.mid_candidates = vec!["not-a-slug".into()];
        assert!(cfg.validate().is_err());

        let mut cfg = RouterConfig::default();
        cfg.timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RouterConfig::default();
        cfg.explore_rate = 1.5;
        assert!(cfg.validate().is_err());
    }
}
