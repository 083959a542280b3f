//! Signed access tokens
//!
//! A token authorizes one upstream URL for a limited time. Format:
//! base64url(no padding) over `{url}:{expires_at}:{signature}`, where the
//! signature is hex(HMAC-SHA256(secret, "{url}:{expires_at}")).
//!
//! Tokens are immutable once issued; expiry is the only termination
//! mechanism (no revocation list). Verification never errors: any decode
//! or signature failure is simply an invalid token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub struct TokenService {
    secret: String,
    /// Tokens within this many seconds of expiry are flagged for renewal
    renew_margin_secs: u64,
}

impl TokenService {
    pub fn new(secret: impl Into<String>, renew_margin_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            renew_margin_secs,
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn sign(&self, url: &str, expires_at: i64) -> String {
        // Hmac::new_from_slice only fails for unusable key lengths, which
        // cannot happen with SHA-256's arbitrary-length keys
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
        mac.update(format!("{}:{}", url, expires_at).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a token authorizing `url` for `ttl_secs` seconds. Pure: no
    /// store writes, no side effects.
    pub fn issue(&self, url: &str, ttl_secs: u64) -> String {
        let expires_at = Self::now() + ttl_secs as i64;
        let signature = self.sign(url, expires_at);
        URL_SAFE_NO_PAD.encode(format!("{}:{}:{}", url, expires_at, signature))
    }

    /// Decode a token into (url, expires_at, signature).
    ///
    /// The URL itself contains `:`; the expiry and signature are the last
    /// two `:`-separated fields, so split from the right.
    fn decode(&self, token: &str) -> Option<(String, i64, String)> {
        let raw = URL_SAFE_NO_PAD.decode(token).ok()?;
        let decoded = String::from_utf8(raw).ok()?;

        let mut parts = decoded.rsplitn(3, ':');
        let signature = parts.next()?.to_string();
        let expires_at: i64 = parts.next()?.parse().ok()?;
        let url = parts.next()?.to_string();

        Some((url, expires_at, signature))
    }

    /// Check that `token` authorizes `url` and has not expired
    pub fn verify(&self, token: &str, url: &str) -> bool {
        let Some((token_url, expires_at, signature)) = self.decode(token) else {
            return false;
        };

        if token_url != url {
            return false;
        }

        if Self::now() >= expires_at {
            return false;
        }

        self.sign(&token_url, expires_at) == signature
    }

    /// Advisory: should the client proactively renew this token?
    /// Undecodable tokens always want renewal.
    pub fn should_renew(&self, token: &str) -> bool {
        match self.decode(token) {
            Some((_, expires_at, _)) => {
                expires_at < Self::now() + self.renew_margin_secs as i64
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret", 600)
    }

    #[test]
    fn test_issued_token_verifies_for_its_url() {
        let svc = service();
        let url = "https://cdn.example/a/b/master.m3u8";
        let token = svc.issue(url, 60);
        assert!(svc.verify(&token, url));
    }

    #[test]
    fn test_token_is_invalid_for_other_urls() {
        let svc = service();
        let token = svc.issue("https://cdn.example/a.m3u8", 60);
        assert!(!svc.verify(&token, "https://cdn.example/b.m3u8"));
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let svc = service();
        // ttl 0 puts expires_at at now; `now >= expires_at` rejects it
        let token = svc.issue("https://cdn.example/a.m3u8", 0);
        assert!(!svc.verify(&token, "https://cdn.example/a.m3u8"));
    }

    #[test]
    fn test_garbage_token_is_invalid_not_an_error() {
        let svc = service();
        assert!(!svc.verify("not-base64!!!", "https://cdn.example/a.m3u8"));
        assert!(!svc.verify("", "https://cdn.example/a.m3u8"));

        // Valid base64 but not token-shaped
        let junk = URL_SAFE_NO_PAD.encode("no-colons-here");
        assert!(!svc.verify(&junk, "https://cdn.example/a.m3u8"));
    }

    #[test]
    fn test_tampered_signature_is_invalid() {
        let svc = service();
        let url = "https://cdn.example/a.m3u8";
        let token = svc.issue(url, 60);

        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(&token).unwrap()).unwrap();
        let mut tampered = decoded;
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        let forged = URL_SAFE_NO_PAD.encode(tampered);

        assert!(!svc.verify(&forged, url));
    }

    #[test]
    fn test_token_signed_with_other_secret_is_invalid() {
        let url = "https://cdn.example/a.m3u8";
        let other = TokenService::new("other-secret", 600);
        let token = other.issue(url, 60);
        assert!(!service().verify(&token, url));
    }

    #[test]
    fn test_urls_with_ports_and_queries_roundtrip() {
        let svc = service();
        let url = "https://cdn.example:8443/live/stream.m3u8?session=abc:123";
        let token = svc.issue(url, 60);
        assert!(svc.verify(&token, url));
    }

    #[test]
    fn test_fresh_token_does_not_want_renewal() {
        let svc = service();
        let token = svc.issue("https://cdn.example/a.m3u8", 3600);
        assert!(!svc.should_renew(&token));
    }

    #[test]
    fn test_near_expiry_token_wants_renewal() {
        let svc = service();
        // 60s left, margin is 600s
        let token = svc.issue("https://cdn.example/a.m3u8", 60);
        assert!(svc.should_renew(&token));
    }

    #[test]
    fn test_undecodable_token_wants_renewal() {
        assert!(service().should_renew("???"));
    }
}
