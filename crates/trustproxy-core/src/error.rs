//! The error taxonomy that crosses the proxy's client-facing boundary.
//!
//! Leaf microcrates stay on `anyhow::Result` the way the rest of this
//! codebase does; `ProxyError` only exists at this umbrella level,
//! where the proxy needs to decide what HTTP status (if any) an
//! internal failure becomes.

use thiserror::Error;

use trustproxy_classifier::Outcome;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Container id unknown, or a patched path vanished on revert.
    #[error("not found: {0}")]
    NotFound(String),

    /// Absolute-path violation, unsupported directory open, malformed
    /// header, bad tar. Abort the current request without mutating state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Out-of-band change to a patched file detected during revert.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Non-2xx (and non-404) response from the Docker daemon.
    #[error("upstream docker daemon error: {0}")]
    Upstream(String),

    /// A classifier outcome that isn't a successful package identity.
    #[error("classification outcome: {0:?}")]
    Classification(Outcome),

    /// Revert failure, rollback failure, or other broken PatchSet
    /// recovery. No safe local recovery exists: the process aborts.
    #[error("fatal invariant violation: {0}")]
    FatalInvariant(String),
}

impl ProxyError {
    /// The HTTP status this error becomes when surfaced to the
    /// proxy's own client. `None` for errors that never reach a
    /// client response — `FatalInvariant` aborts the process instead.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ProxyError::NotFound(_) => Some(404),
            ProxyError::InvalidRequest(_) => Some(400),
            ProxyError::Conflict(_) => Some(409),
            ProxyError::Upstream(_) => Some(500),
            ProxyError::Classification(_) | ProxyError::FatalInvariant(_) => None,
        }
    }

    /// Whether this condition means daemon-log-and-exit rather than
    /// a translatable per-request failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::FatalInvariant(_))
    }

    /// Classify an `anyhow::Error` surfaced by a microcrate at the
    /// proxy boundary. Recognizes the one concrete typed error the
    /// crates hand back (`ContainerNotFound`) and otherwise treats the
    /// failure as an opaque upstream error.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        if let Some(not_found) = err.downcast_ref::<trustproxy_fs::ContainerNotFound>() {
            return ProxyError::NotFound(not_found.0.clone());
        }
        ProxyError::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping_matches_taxonomy() {
        assert_eq!(ProxyError::NotFound("x".into()).http_status(), Some(404));
        assert_eq!(ProxyError::InvalidRequest("x".into()).http_status(), Some(400));
        assert_eq!(ProxyError::Conflict("x".into()).http_status(), Some(409));
        assert_eq!(ProxyError::Upstream("x".into()).http_status(), Some(500));
        assert_eq!(ProxyError::FatalInvariant("x".into()).http_status(), None);
    }

    #[test]
    fn fatal_invariant_is_the_only_fatal_variant() {
        assert!(ProxyError::FatalInvariant("x".into()).is_fatal());
        assert!(!ProxyError::Conflict("x".into()).is_fatal());
        assert!(!ProxyError::NotFound("x".into()).is_fatal());
    }

    #[test]
    fn from_anyhow_recognizes_container_not_found() {
        let err: anyhow::Error = trustproxy_fs::ContainerNotFound("deadbeef".to_string()).into();
        let mapped = ProxyError::from_anyhow(err);
        assert!(matches!(mapped, ProxyError::NotFound(ref id) if id == "deadbeef"));
    }

    #[test]
    fn from_anyhow_falls_back_to_upstream() {
        let err = anyhow::anyhow!("connection reset");
        let mapped = ProxyError::from_anyhow(err);
        assert!(matches!(mapped, ProxyError::Upstream(_)));
    }
}
