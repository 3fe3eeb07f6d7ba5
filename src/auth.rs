use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Hash a raw token so the configured secret is never compared in the clear.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Expected digest of the admin token; `None` leaves the API open.
#[derive(Clone, Default)]
pub struct AdminToken(Option<Arc<str>>);

impl AdminToken {
    pub fn new(token: Option<&str>) -> Self {
        Self(
            token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| Arc::from(hash_token(t))),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    fn accepts(&self, presented: &str) -> bool {
        match &self.0 {
            Some(expected) => hash_token(presented) == **expected,
            None => true,
        }
    }
}

/// Middleware that validates the Bearer token against the configured admin token.
pub async fn require_admin_token(
    State(token): State<AdminToken>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if token.is_enabled() {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        if !token.accepts(presented.trim()) {
            tracing::warn!("Rejected management request with invalid token");
            return Err(AppError::Unauthorized);
        }
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_digest_comparison() {
        let token = AdminToken::new(Some("s3cret"));
        assert!(token.is_enabled());
        assert!(token.accepts("s3cret"));
        assert!(!token.accepts("S3CRET"));
        assert_eq!(hash_token("s3cret").len(), 64);
    }

    #[test]
    fn blank_token_disables_auth() {
        let token = AdminToken::new(Some("  "));
        assert!(!token.is_enabled());
        assert!(token.accepts("anything"));
        assert!(!AdminToken::new(None).is_enabled());
    }
}
