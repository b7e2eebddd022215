use thiserror::Error;

/// Provider error classes. The variant decides what happens next: only
/// `TryAgainLater` is retried, `InvalidEndpoint` kills the device config,
/// everything else just drops the one notification.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid endpoint")]
    InvalidEndpoint,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("push service asked to try again later")]
    TryAgainLater,
    #[error("push service internal error")]
    InternalServerError,
    #[error("unexpected push failure: {0}")]
    Unexpected(String),
}

impl PushError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PushError::TryAgainLater)
    }
}

pub fn classify_status(status: u16, body: &str) -> PushError {
    match status {
        400 => PushError::BadRequest(body.to_string()),
        401 => PushError::Unauthorized,
        403 => PushError::Forbidden,
        404 | 410 => PushError::InvalidEndpoint,
        413 => PushError::PayloadTooLarge,
        429 | 503 => PushError::TryAgainLater,
        500 => PushError::InternalServerError,
        other => PushError::Unexpected(format!("HTTP {}: {}", other, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(classify_status(400, "x"), PushError::BadRequest(_)));
        assert!(matches!(classify_status(401, ""), PushError::Unauthorized));
        assert!(matches!(classify_status(403, ""), PushError::Forbidden));
        assert!(matches!(classify_status(404, ""), PushError::InvalidEndpoint));
        assert!(matches!(classify_status(410, ""), PushError::InvalidEndpoint));
        assert!(matches!(classify_status(413, ""), PushError::PayloadTooLarge));
        assert!(matches!(classify_status(429, ""), PushError::TryAgainLater));
        assert!(matches!(classify_status(503, ""), PushError::TryAgainLater));
        assert!(matches!(
            classify_status(500, ""),
            PushError::InternalServerError
        ));
        assert!(matches!(classify_status(418, ""), PushError::Unexpected(_)));
    }

    #[test]
    fn only_try_again_later_is_retryable() {
        assert!(PushError::TryAgainLater.is_retryable());
        assert!(!PushError::InvalidEndpoint.is_retryable());
        assert!(!PushError::Unexpected("x".into()).is_retryable());
    }
}
