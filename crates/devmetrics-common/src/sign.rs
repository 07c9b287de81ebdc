//! HMAC-SHA256 tags over a metric's canonical `id:type:value` message.

use crate::types::MetricRecord;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn keyed_mac(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC can take key of any size")
}

/// Returns the hex-encoded HMAC-SHA256 of `message` under `secret`.
///
/// Deterministic: the same message and secret always produce the same tag.
///
/// ```
/// use devmetrics_common::sign::sign;
///
/// let a = sign("PollCount:counter:5", "secret");
/// assert_eq!(a, sign("PollCount:counter:5", "secret"));
/// assert_eq!(a.len(), 64);
/// ```
pub fn sign(message: &str, secret: &str) -> String {
    let mut mac = keyed_mac(secret.as_bytes());
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Recomputes the tag of `record` and compares it to the carried hash in
/// constant time.
///
/// An empty carried hash passes; callers that need integrity on every
/// record must reject empty hashes themselves.
pub fn verify(record: &MetricRecord, secret: &str) -> bool {
    if record.hash.is_empty() {
        return true;
    }
    let Ok(value) = record.to_value() else {
        return false;
    };
    let Ok(expected) = hex::decode(record.hash.trim()) else {
        return false;
    };
    let mut mac = keyed_mac(secret.as_bytes());
    mac.update(value.canonical_message(&record.id).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Shared-secret holder used by the agent and the server.
///
/// A signer without a key still signs outgoing records (an HMAC over an
/// empty key), but [`Signer::is_keyed`] reports `false` so the server can
/// skip verification when no secret is configured.
#[derive(Clone, Default)]
pub struct Signer {
    secret: Option<String>,
}

impl Signer {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    pub fn is_keyed(&self) -> bool {
        self.secret.is_some()
    }

    pub fn sign(&self, message: &str) -> String {
        sign(message, self.secret.as_deref().unwrap_or_default())
    }

    pub fn verify(&self, record: &MetricRecord) -> bool {
        verify(record, self.secret.as_deref().unwrap_or_default())
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("keyed", &self.is_keyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricValue;

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            sign("what do ya want for nothing?", "Jefe"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_any_key_length() {
        assert_eq!(sign("m", "").len(), 64);
        assert_eq!(sign("m", &"k".repeat(4096)).len(), 64);
    }

    #[test]
    fn test_signed_records_verify() {
        let signer = Signer::new(Some("k3y"));
        for value in [
            MetricValue::Gauge(0.001),
            MetricValue::Gauge(-12345.678),
            MetricValue::Counter(0),
            MetricValue::Counter(i64::MIN),
        ] {
            let rec = value.to_record("Metric", &signer);
            assert!(signer.verify(&rec), "{value:?}");
        }
    }

    #[test]
    fn test_tampered_value_fails() {
        let signer = Signer::new(Some("k3y"));
        let mut rec = MetricValue::Counter(10).to_record("PollCount", &signer);
        rec.delta = Some(11);
        assert!(!signer.verify(&rec));

        let mut rec = MetricValue::Gauge(1.5).to_record("Alloc", &signer);
        rec.id = "Alloc2".into();
        assert!(!signer.verify(&rec));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let rec = MetricValue::Gauge(2.0).to_record("Alloc", &Signer::new(Some("a")));
        assert!(!Signer::new(Some("b")).verify(&rec));
    }

    #[test]
    fn test_empty_hash_passes_and_garbage_fails() {
        let signer = Signer::new(Some("k3y"));
        let mut rec = MetricValue::Gauge(2.0).to_record("Alloc", &signer);
        rec.hash.clear();
        assert!(signer.verify(&rec));
        rec.hash = "zz-not-hex".into();
        assert!(!signer.verify(&rec));
    }

    #[test]
    fn test_empty_secret_is_unkeyed() {
        assert!(!Signer::new(Some("")).is_keyed());
        assert!(!Signer::new(None).is_keyed());
        assert!(Signer::new(Some("x")).is_keyed());
    }
}
