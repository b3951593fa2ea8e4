//! Time-based one-time codes (RFC 6238, HMAC-SHA1).

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

const DEFAULT_DIGITS: u32 = 6;
const DEFAULT_PERIOD: u64 = 30;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TotpError {
    #[error("otpauth URI has no secret parameter")]
    MissingSecret,
    #[error("TOTP seed is not valid base32")]
    InvalidSeed,
    #[error("unsupported TOTP algorithm {0:?}; only SHA1 is supported")]
    UnsupportedAlgorithm(String),
    #[error("invalid TOTP parameter {name}={value:?}")]
    InvalidParameter { name: &'static str, value: String },
}

/// A decoded TOTP seed plus its code parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct TotpSeed {
    key: Vec<u8>,
    digits: u32,
    period: u64,
}

impl std::fmt::Debug for TotpSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotpSeed")
            .field("digits", &self.digits)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl TotpSeed {
    /// Accepts an `otpauth://totp/...?secret=...` URI or a bare base32 seed.
    pub fn parse(value: &str) -> Result<Self, TotpError> {
        let value = value.trim();
        if let Some(rest) = value.strip_prefix("otpauth://") {
            return Self::parse_uri(rest);
        }
        Ok(Self {
            key: decode_base32(value)?,
            digits: DEFAULT_DIGITS,
            period: DEFAULT_PERIOD,
        })
    }

    fn parse_uri(rest: &str) -> Result<Self, TotpError> {
        let query = rest.split_once('?').map(|(_, q)| q).unwrap_or_default();

        let mut key = None;
        let mut digits = DEFAULT_DIGITS;
        let mut period = DEFAULT_PERIOD;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(raw)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| raw.to_string());

            match name.to_ascii_lowercase().as_str() {
                "secret" => key = Some(decode_base32(&value)?),
                "digits" => {
                    digits = value
                        .parse()
                        .ok()
                        .filter(|d| (6..=8).contains(d))
                        .ok_or(TotpError::InvalidParameter {
                            name: "digits",
                            value: value.clone(),
                        })?;
                }
                "period" => {
                    period = value.parse().ok().filter(|p| *p > 0).ok_or(
                        TotpError::InvalidParameter {
                            name: "period",
                            value: value.clone(),
                        },
                    )?;
                }
                "algorithm" if !value.eq_ignore_ascii_case("sha1") => {
                    return Err(TotpError::UnsupportedAlgorithm(value));
                }
                _ => {}
            }
        }

        Ok(Self {
            key: key.ok_or(TotpError::MissingSecret)?,
            digits,
            period,
        })
    }

    /// The code valid at `at`.
    pub fn code_at(&self, at: DateTime<Utc>) -> Result<String, TotpError> {
        let counter = (at.timestamp().max(0) as u64) / self.period;

        let mut mac = Hmac::<Sha1>::new_from_slice(&self.key).map_err(|_| TotpError::InvalidSeed)?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        let code = binary % 10u32.pow(self.digits);

        Ok(format!("{code:0width$}", width = self.digits as usize))
    }
}

fn decode_base32(value: &str) -> Result<Vec<u8>, TotpError> {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return Err(TotpError::InvalidSeed);
    }
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| TotpError::InvalidSeed)
}
