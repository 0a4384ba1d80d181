//! Deterministic placeholder identities
//!
//! When no authoritative company can be found, a record still gets a stable
//! identifier so downstream joins group the same business key together. The
//! identifier is keyed with a secret salt so it cannot be enumerated from
//! guessed names.
//!
//! Format: `{prefix}{base32(hmac_sha256(salt, business_key))[0..16]}`

use base32::Alphabet;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::TempIdError;
use crate::normalize::normalize;

type HmacSha256 = Hmac<Sha256>;

/// Prefix reserved for placeholder identities.
pub const DEFAULT_TEMP_ID_PREFIX: &str = "IN_";

/// Joins the normalized name and the secondary code in a business key.
pub const BUSINESS_KEY_SEPARATOR: char = '|';

/// 16 base32 chars = 80 bits.
const ENCODED_LEN: usize = 16;

/// Which signals make up the business key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempIdKeyStrategy {
    /// Normalized name only; the same name groups across plans.
    #[default]
    NameOnly,
    /// Normalized name plus the strongest structured code.
    NameWithCode,
}

/// Builds the business key for a record.
///
/// Returns `None` when there is nothing to key on.
pub fn business_key(
    normalized_name: Option<&str>,
    secondary_code: Option<&str>,
    strategy: TempIdKeyStrategy,
) -> Option<String> {
    let name = normalized_name.filter(|n| !n.is_empty());
    let code = secondary_code.map(normalize).filter(|c| !c.is_empty());

    match (name, code, strategy) {
        (Some(name), Some(code), TempIdKeyStrategy::NameWithCode) => {
            Some(format!("{name}{BUSINESS_KEY_SEPARATOR}{code}"))
        }
        (Some(name), _, _) => Some(name.to_string()),
        (None, Some(code), _) => Some(code),
        (None, None, _) => None,
    }
}

/// HMAC-based generator for placeholder identities.
#[derive(Clone)]
pub struct TempIdGenerator {
    mac: HmacSha256,
    prefix: String,
}

impl std::fmt::Debug for TempIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempIdGenerator")
            .field("prefix", &self.prefix)
            .field("salt", &"<redacted>")
            .finish()
    }
}

impl TempIdGenerator {
    pub fn new(salt: &str, prefix: impl Into<String>) -> Result<Self, TempIdError> {
        if salt.is_empty() {
            return Err(TempIdError::EmptySalt);
        }
        let mac =
            HmacSha256::new_from_slice(salt.as_bytes()).map_err(|_| TempIdError::EmptySalt)?;
        Ok(Self {
            mac,
            prefix: prefix.into(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive the placeholder identity for a business key.
    pub fn generate(&self, business_key: &str) -> Result<String, TempIdError> {
        if business_key.is_empty() {
            return Err(TempIdError::EmptyBusinessKey);
        }

        let mut mac = self.mac.clone();
        mac.update(business_key.as_bytes());
        let digest = mac.finalize().into_bytes();

        let encoded = base32::encode(Alphabet::Rfc4648 { padding: false }, &digest);
        let short = encoded.get(..ENCODED_LEN).unwrap_or(&encoded);

        Ok(format!("{}{}", self.prefix, short))
    }

    /// Whether an identifier was produced by a generator with this prefix.
    pub fn is_temp_id(&self, company_id: &str) -> bool {
        is_temp_id_with_prefix(company_id, &self.prefix)
    }
}

/// Prefix, then exactly `ENCODED_LEN` RFC 4648 base32 characters.
pub fn is_temp_id_with_prefix(company_id: &str, prefix: &str) -> bool {
    company_id
        .strip_prefix(prefix)
        .is_some_and(|suffix| {
            suffix.len() == ENCODED_LEN
                && suffix
                    .bytes()
                    .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
        })
}
