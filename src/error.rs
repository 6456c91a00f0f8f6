use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reconcile error: {0}")]
    Reconcile(String),

    /// Must not be retried by the code path that raised it.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Expected artifact not there yet; retry after a short delay.
    #[error("Temporary failure: {0}")]
    Temporary(String),

    #[error("Transition {event} not allowed from state {from}")]
    TransitionNotAllowed { event: String, from: String },

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a failure is routed by the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Permanent,
    Temporary,
    Unclassified,
}

impl Error {
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
    pub fn temporary(msg: impl Into<String>) -> Self {
        Self::Temporary(msg.into())
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Permanent(_) | Self::TransitionNotAllowed { .. } | Self::Config(_) => {
                Severity::Permanent
            }
            Self::Temporary(_) => Severity::Temporary,
            Self::Kube(e) => kube_severity(e),
            Self::Http(e) if e.is_timeout() || e.is_connect() => Severity::Temporary,
            _ => Severity::Unclassified,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.severity() == Severity::Temporary
    }
}

/// Server-side overload, throttling, write conflicts and broken connections
/// clear on their own.
fn kube_severity(err: &kube::Error) -> Severity {
    match err {
        kube::Error::Api(e) if e.code >= 500 || e.code == 429 || e.code == 409 => {
            Severity::Temporary
        }
        kube::Error::HyperError(_) | kube::Error::Service(_) => Severity::Temporary,
        _ => Severity::Unclassified,
    }
}

/// True when a kube API call failed with the given HTTP status code.
pub fn is_api_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(Error::permanent("x").severity(), Severity::Permanent);
        assert_eq!(Error::temporary("x").severity(), Severity::Temporary);
        assert_eq!(Error::config("bad").severity(), Severity::Permanent);
        assert_eq!(Error::reconcile("x").severity(), Severity::Unclassified);
        let e = Error::TransitionNotAllowed {
            event: "boot".into(),
            from: "READY".into(),
        };
        assert_eq!(e.severity(), Severity::Permanent);
    }

    #[test]
    fn test_is_temporary() {
        assert!(Error::temporary("kubeconfig not written").is_temporary());
        assert!(!Error::reconcile("x").is_temporary());
    }

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} from the API server"),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn test_transient_api_errors_are_temporary() {
        for (code, reason) in [
            (503, "ServiceUnavailable"),
            (500, "InternalError"),
            (429, "TooManyRequests"),
            (409, "Conflict"),
        ] {
            assert_eq!(api_error(code, reason).severity(), Severity::Temporary, "{code}");
        }
    }

    #[test]
    fn test_rejected_requests_stay_unclassified() {
        for (code, reason) in [(422, "Invalid"), (403, "Forbidden"), (404, "NotFound")] {
            assert_eq!(api_error(code, reason).severity(), Severity::Unclassified, "{code}");
        }
    }
}
