//! §4.11 auth interceptor: every RPC carries an HMAC-SHA256 bearer token,
//! computed over a canonical request representation and keyed by the
//! configured sign-key. Verification is constant-time via `Mac::verify_slice`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{OrchError, OrchResult};

type HmacSha256 = Hmac<Sha256>;

/// Holds the sign-key (used to verify inbound tokens) and the auth-key
/// (the bearer value a caller must additionally present, matching the
/// config's `auth-key`/`sign-key` pair named in §6).
pub struct AuthInterceptor {
    sign_key: Vec<u8>,
    auth_key: String,
}

impl AuthInterceptor {
    pub fn new(sign_key: impl Into<Vec<u8>>, auth_key: impl Into<String>) -> Self {
        Self {
            sign_key: sign_key.into(),
            auth_key: auth_key.into(),
        }
    }

    /// Sign `canonical_request` (method name + marshaled body, whatever the
    /// caller considers canonical) with the sign-key, returning the bearer
    /// token a client should present on every RPC.
    pub fn sign(&self, canonical_request: &[u8]) -> OrchResult<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|e| OrchError::Internal(format!("build hmac: {e}")))?;
        mac.update(canonical_request);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify a bearer token against `canonical_request`. The presented
    /// `auth_key` must also match — the signature alone only proves the
    /// caller shares the sign-key, not that it's presenting as the
    /// configured principal.
    pub fn authenticate(
        &self,
        presented_auth_key: &str,
        canonical_request: &[u8],
        token_hex: &str,
    ) -> OrchResult<()> {
        if presented_auth_key != self.auth_key {
            return Err(OrchError::PermissionDenied("auth key mismatch".into()));
        }
        let token = hex::decode(token_hex)
            .map_err(|_| OrchError::PermissionDenied("malformed bearer token".into()))?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|e| OrchError::Internal(format!("build hmac: {e}")))?;
        mac.update(canonical_request);
        mac.verify_slice(&token)
            .map_err(|_| OrchError::PermissionDenied("bearer token does not verify".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_authenticate_round_trips() {
        let interceptor = AuthInterceptor::new(b"sign-key".to_vec(), "auth-key");
        let token = interceptor.sign(b"Ping:{}").unwrap();
        assert!(
            interceptor
                .authenticate("auth-key", b"Ping:{}", &token)
                .is_ok()
        );
    }

    #[test]
    fn wrong_auth_key_is_rejected() {
        let interceptor = AuthInterceptor::new(b"sign-key".to_vec(), "auth-key");
        let token = interceptor.sign(b"Ping:{}").unwrap();
        let err = interceptor
            .authenticate("wrong-key", b"Ping:{}", &token)
            .unwrap_err();
        assert!(matches!(err, OrchError::PermissionDenied(_)));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let interceptor = AuthInterceptor::new(b"sign-key".to_vec(), "auth-key");
        let mut token = interceptor.sign(b"Ping:{}").unwrap();
        let flipped = if token.starts_with('0') { '1' } else { '0' };
        token.replace_range(0..1, &flipped.to_string());
        let err = interceptor
            .authenticate("auth-key", b"Ping:{}", &token)
            .unwrap_err();
        assert!(matches!(err, OrchError::PermissionDenied(_)));
    }

    #[test]
    fn tampered_request_is_rejected() {
        let interceptor = AuthInterceptor::new(b"sign-key".to_vec(), "auth-key");
        let token = interceptor.sign(b"Ping:{}").unwrap();
        let err = interceptor
            .authenticate("auth-key", b"Ping:{\"x\":1}", &token)
            .unwrap_err();
        assert!(matches!(err, OrchError::PermissionDenied(_)));
    }
}
