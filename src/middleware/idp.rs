use axum::{
    body::{to_bytes, Body},
    extract::{Extension, Request},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::{
    clock::{Clock, SharedClock},
    errors::{AppError, Result},
};

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-idp-timestamp";
pub const SIGNATURE_HEADER: &str = "x-idp-signature";

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Authenticates calls made by the identity provider.
///
/// The provider signs `{timestamp}.{METHOD}.{path}.{body}` with HMAC-SHA256 under
/// the shared secret and sends the unix timestamp and the URL-safe base64 MAC in
/// `X-Idp-Timestamp` / `X-Idp-Signature`. Without a configured secret every call
/// is refused.
pub struct IdpVerifier {
    secret: Option<Vec<u8>>,
    max_skew: Duration,
    clock: SharedClock,
}

impl IdpVerifier {
    pub fn new(secret: Option<&str>, max_skew: Duration, clock: SharedClock) -> Self {
        Self {
            secret: secret.map(|s| s.as_bytes().to_vec()),
            max_skew,
            clock,
        }
    }

    fn mac(key: &[u8], timestamp: i64, method: &str, path: &str, body: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| AppError::internal(format!("HMAC key error: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(method.as_bytes());
        mac.update(b".");
        mac.update(path.as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }

    /// Signature header value for a request
    pub fn sign(&self, timestamp: i64, method: &str, path: &str, body: &[u8]) -> Result<String> {
        let key = self.secret.as_deref().ok_or(AppError::Forbidden)?;
        let mac = Self::mac(key, timestamp, method, path, body)?;
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<()> {
        let Some(key) = self.secret.as_deref() else {
            return Err(AppError::Forbidden);
        };
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            return Err(AppError::Unauthorized);
        };

        let timestamp: i64 = timestamp.trim().parse().map_err(|_| AppError::Unauthorized)?;
        let skew = (self.clock.now().timestamp() - timestamp).unsigned_abs();
        if skew > self.max_skew.as_secs() {
            return Err(AppError::Unauthorized);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature.trim())
            .map_err(|_| AppError::Unauthorized)?;

        // Constant-time comparison
        Self::mac(key, timestamp, method, path, body)?
            .verify_slice(&signature)
            .map_err(|_| AppError::Unauthorized)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Route layer for endpoints only the identity provider may call
pub async fn require_identity_provider(
    Extension(verifier): Extension<Arc<IdpVerifier>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return AppError::bad_request("Request body too large").into_response(),
    };

    if let Err(e) = verifier.verify(
        header(&parts.headers, TIMESTAMP_HEADER),
        header(&parts.headers, SIGNATURE_HEADER),
        parts.method.as_str(),
        parts.uri.path(),
        &bytes,
    ) {
        warn!(path = %parts.uri.path(), "Rejected identity provider call: {}", e);
        return e.into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}
