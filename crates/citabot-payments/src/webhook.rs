//! Webhook signature verification.
//!
//! The processor signs `{timestamp}.{raw_body}` with HMAC-SHA256 and sends
//! `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>...]`. Platform-payment
//! and subscription-billing endpoints use separate secrets.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{PaymentsError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Reject events whose timestamp is further than this from now.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verify a signature header against the raw request body.
pub fn verify_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now_unix: i64,
) -> Result<()> {
    let (timestamp, candidates) = parse_signature_header(signature_header)?;

    if (now_unix - timestamp).abs() > DEFAULT_TOLERANCE_SECS {
        return Err(PaymentsError::Signature(format!(
            "timestamp outside tolerance: {timestamp}"
        )));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PaymentsError::Signature("invalid secret length".into()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    for candidate in &candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        if mac.clone().verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(PaymentsError::Signature("no matching v1 signature".into()))
}

/// Parse `t=<unix>,v1=<hex>,…` into the timestamp and v1 candidates.
fn parse_signature_header(header: &str) -> Result<(i64, Vec<String>)> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(v)) => {
                timestamp = v.parse::<i64>().ok();
            }
            (Some("v1"), Some(v)) => candidates.push(v.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| PaymentsError::Signature("missing or malformed t= field".into()))?;
    if candidates.is_empty() {
        return Err(PaymentsError::Signature("missing v1= signature".into()));
    }
    Ok((timestamp, candidates))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let digest = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={digest}")
    }

    #[test]
    fn valid_signature_verifies() {
        let payload = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;
        let now = 1_720_000_000;
        let header = sign(payload, "whsec_test", now);
        assert!(verify_signature(payload, &header, "whsec_test", now).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = b"{}";
        let now = 1_720_000_000;
        let header = sign(payload, "whsec_a", now);
        assert!(verify_signature(payload, &header, "whsec_b", now).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let now = 1_720_000_000;
        let header = sign(b"{\"amount\":100}", "whsec_test", now);
        assert!(verify_signature(b"{\"amount\":999}", &header, "whsec_test", now).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = b"{}";
        let signed_at = 1_720_000_000;
        let header = sign(payload, "whsec_test", signed_at);
        let now = signed_at + DEFAULT_TOLERANCE_SECS + 1;
        assert!(verify_signature(payload, &header, "whsec_test", now).is_err());
    }

    #[test]
    fn second_v1_candidate_is_accepted() {
        // Secret rotation sends two v1 entries; either may match.
        let payload = b"{}";
        let now = 1_720_000_000;
        let good = sign(payload, "whsec_new", now);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={now},v1=deadbeef,v1={good_sig}");
        assert!(verify_signature(payload, &header, "whsec_new", now).is_ok());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let payload = b"{}";
        assert!(verify_signature(payload, "", "s", 0).is_err());
        assert!(verify_signature(payload, "t=abc,v1=00", "s", 0).is_err());
        assert!(verify_signature(payload, "t=100", "s", 100).is_err());
    }
}
