//! Signing contract.
//!
//! Token generation is not implemented here: the client only defines the
//! seam. Callers inject a [`Signer`] that turns an upload policy into a
//! bearer token and (optionally) signs management requests. The tests ship
//! trivial fake signers; production deployments plug in the real credential
//! scheme.

use serde::Serialize;
use url::Url;

/// Upload policy signed into an upload token.
///
/// The scope is `"<bucket>"` for bucket-wide tokens or `"<bucket>:<key>"`
/// to pin the token to one object; the deadline is a unix timestamp in
/// seconds after which the token is rejected.
#[derive(Debug, Clone, Serialize)]
pub struct UploadPolicy {
    /// Target scope, `bucket` or `bucket:key`.
    pub scope: String,
    /// Expiry as unix seconds.
    pub deadline: u64,
}

impl UploadPolicy {
    /// Builds a policy scoped to a single object, expiring `ttl_secs` from
    /// now.
    #[must_use]
    pub fn for_object(bucket: &str, key: &str, ttl_secs: u64) -> Self {
        Self {
            scope: format!("{bucket}:{key}"),
            deadline: unix_now() + ttl_secs,
        }
    }

    /// Builds a bucket-wide policy expiring `ttl_secs` from now.
    #[must_use]
    pub fn for_bucket(bucket: &str, ttl_secs: u64) -> Self {
        Self {
            scope: bucket.to_string(),
            deadline: unix_now() + ttl_secs,
        }
    }
}

/// Credential seam injected into every component that authenticates.
///
/// Implementations own the secret key; it never leaves them.
pub trait Signer: Send + Sync + std::fmt::Debug {
    /// Signs an upload policy into an opaque bearer token, sent as
    /// `Authorization: UpToken <token>` on upload and telemetry requests.
    fn sign_upload_policy(&self, policy: &UploadPolicy) -> String;

    /// Produces the `Authorization` header value for a management (rs/rsf)
    /// request, or `None` when the deployment runs unauthenticated.
    fn authorization(&self, method: &str, url: &Url, body: Option<&[u8]>) -> Option<String>;
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_for_object_scope() {
        let policy = UploadPolicy::for_object("bkt", "a/b.bin", 60);
        assert_eq!(policy.scope, "bkt:a/b.bin");
        assert!(policy.deadline > unix_now());
    }

    #[test]
    fn test_policy_serializes_expected_shape() {
        let policy = UploadPolicy {
            scope: "bkt:key".to_string(),
            deadline: 1234,
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"{"scope":"bkt:key","deadline":1234}"#);
    }
}
