//! Error kinds for the routing plugin.
//!
//! Only `ConfigInvalid` is ever fatal, and only at startup. Every other
//! variant is absorbed somewhere along the routing path and downgraded into
//! a flagged decision; the host gateway never sees these from the pre-hook.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("artifact fetch failed: {0}")]
    ArtifactFetch(String),

    #[error("artifact rejected: {0}")]
    ArtifactInvalid(String),

    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("no feasible candidate for the request")]
    NoFeasibleCandidate,

    #[error("malformed credentials")]
    AuthMalformed,
}

impl RouterError {
    /// Stable machine-readable tag used in telemetry and fallback reasons.
    pub fn tag(&self) -> &'static str {
        match self {
            RouterError::ConfigInvalid(_) => "config-invalid",
            RouterError::ArtifactFetch(_) => "artifact-fetch",
            RouterError::ArtifactInvalid(_) => "artifact-invalid",
            RouterError::EmbeddingService(_) => "embedding-service",
            RouterError::CatalogUnavailable(_) => "catalog-unavailable",
            RouterError::CircuitOpen(_) => "circuit-open",
            RouterError::DeadlineExceeded => "deadline-exceeded",
            RouterError::NoFeasibleCandidate => "no-feasible-candidate",
            RouterError::AuthMalformed => "auth-malformed",
        }
    }
}
