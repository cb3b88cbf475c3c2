//! License key format: `AUR-{PLAN3}-V{n}-{RAND8}-{SIG8}`.
//!
//! `PLAN3` is one of `BAS`, `PRO`, `ENT`. `RAND8` is 8 random uppercase base32 characters.
//! `SIG8` is the first 8 hex characters (uppercase) of an HMAC-SHA256 over the key's prefix
//! (everything before the signature segment) keyed by a process-wide secret bound to the
//! owning customer id. Verification is prefix-regex first, then constant-time HMAC compare,
//! so a caller never learns *why* a key failed from timing alone.

use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use sha2::Sha256;
use subtle::ConstantTimeEq as _;

type HmacSha256 = Hmac<Sha256>;

const RAND_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTVWXYZ0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Plan {
    #[serde(rename = "basic")]
    Basic,
    #[serde(rename = "pro")]
    Pro,
    #[serde(rename = "enterprise")]
    Enterprise,
}

impl Plan {
    const fn code(self) -> &'static str {
        match self {
            Plan::Basic => "BAS",
            Plan::Pro => "PRO",
            Plan::Enterprise => "ENT",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "BAS" => Some(Plan::Basic),
            "PRO" => Some(Plan::Pro),
            "ENT" => Some(Plan::Enterprise),
            _ => None,
        }
    }

    /// Default terminal seat count for a freshly minted license on this plan.
    pub const fn default_max_terminals(self) -> u32 {
        match self {
            Plan::Basic => 2,
            Plan::Pro => 5,
            Plan::Enterprise => 25,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LicenseKeyError {
    #[error("license key does not match the expected format")]
    MalformedKey,
    #[error("license key signature is invalid")]
    InvalidSignature,
}

/// A license key split into its semantic parts, after format validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLicenseKey {
    pub plan: Plan,
    pub version: u8,
    pub random_segment: String,
    pub signature: String,
}

static KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^AUR-(BAS|PRO|ENT)-V([0-9])-([A-Z0-9]{8})-([A-F0-9]{8})$").expect("valid regex"));

fn prefix(plan: Plan, version: u8, random_segment: &str) -> String {
    format!("AUR-{}-V{version}-{random_segment}", plan.code())
}

fn sign(secret: &[u8], customer_id: &str, prefix: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(customer_id.as_bytes());
    mac.update(b":");
    mac.update(prefix.as_bytes());
    let digest = mac.finalize().into_bytes();
    hex::encode_upper(&digest[..4])
}

/// Parses the textual format only; does not verify the signature.
///
/// Use [`verify`] (or [`parse_and_verify`]) to authenticate a key received from a caller.
pub fn parse(key: &str) -> Result<ParsedLicenseKey, LicenseKeyError> {
    let captures = KEY_REGEX.captures(key).ok_or(LicenseKeyError::MalformedKey)?;

    let plan = Plan::from_code(&captures[1]).ok_or(LicenseKeyError::MalformedKey)?;
    let version: u8 = captures[2].parse().map_err(|_| LicenseKeyError::MalformedKey)?;

    Ok(ParsedLicenseKey {
        plan,
        version,
        random_segment: captures[3].to_owned(),
        signature: captures[4].to_owned(),
    })
}

/// Verifies the key's signature in constant time. Does not re-validate the format (call
/// [`parse`] first); a malformed key should already have been rejected earlier in the
/// pipeline with a distinct error so operators can tell shape mismatches from tampering.
pub fn verify(key: &str, customer_id: &str, secret: &[u8]) -> Result<ParsedLicenseKey, LicenseKeyError> {
    let parsed = parse(key)?;

    let expected_prefix = prefix(parsed.plan, parsed.version, &parsed.random_segment);
    let expected_signature = sign(secret, customer_id, &expected_prefix);

    if expected_signature.as_bytes().ct_eq(parsed.signature.as_bytes()).into() {
        Ok(parsed)
    } else {
        Err(LicenseKeyError::InvalidSignature)
    }
}

/// Mints a fresh license key for `customer_id` on `plan`, at the current key-format version.
pub fn mint(plan: Plan, customer_id: &str, secret: &[u8]) -> String {
    let mut rng = rand::thread_rng();
    let random_segment: String = (0..8)
        .map(|_| RAND_ALPHABET[rng.gen_range(0..RAND_ALPHABET.len())] as char)
        .collect();

    const CURRENT_VERSION: u8 = 2;

    let prefix = prefix(plan, CURRENT_VERSION, &random_segment);
    let signature = sign(secret, customer_id, &prefix);

    format!("{prefix}-{signature}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn mint_then_verify_round_trips() {
        let secret = b"test-secret";
        let key = mint(Plan::Pro, "cust_1", secret);
        let parsed = verify(&key, "cust_1", secret).expect("signature should verify");
        assert_eq!(parsed.plan, Plan::Pro);
    }

    #[test]
    fn verify_rejects_wrong_customer() {
        let secret = b"test-secret";
        let key = mint(Plan::Basic, "cust_1", secret);
        let err = verify(&key, "cust_2", secret).unwrap_err();
        assert!(matches!(err, LicenseKeyError::InvalidSignature));
    }

    #[rstest]
    #[case(0)]
    #[case(4)]
    #[case(9)]
    #[case(19)]
    fn altering_any_prefix_character_breaks_the_signature(#[case] index: usize) {
        let secret = b"test-secret";
        let key = mint(Plan::Enterprise, "cust_42", secret);

        let mut chars: Vec<char> = key.chars().collect();
        // Flip a character that is guaranteed to land inside the prefix (before the final dash).
        let flip_at = index.min(chars.len() - 10);
        chars[flip_at] = if chars[flip_at] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        if let Ok(parsed) = parse(&tampered) {
            let expected_prefix = prefix(parsed.plan, parsed.version, &parsed.random_segment);
            let expected_signature = sign(secret, "cust_42", &expected_prefix);
            assert_ne!(expected_signature, parsed.signature, "mutation should invalidate the signature");
        }
        // A mutation that also breaks the regex shape is rejected earlier, which is fine too.
    }

    #[test]
    fn malformed_keys_are_rejected_before_signature_check() {
        assert!(matches!(parse("not-a-license-key"), Err(LicenseKeyError::MalformedKey)));
        assert!(matches!(parse("AUR-XXX-V2-ABCDEFGH-12345678"), Err(LicenseKeyError::MalformedKey)));
    }
}
