/**
 * TOTP ENGINE - Codes à usage unique basés sur le temps (RFC 6238)
 *
 * RÔLE : Génère les secrets 2FA, calcule les codes à 6 chiffres et vérifie
 * les codes soumis avec une fenêtre de ±1 pas (±30s).
 *
 * ANTI-REJEU : chaque pas accepté est mémorisé par secret ; un code dont le
 * pas est inférieur ou égal au dernier pas accepté est refusé, même s'il est
 * mathématiquement correct.
 */

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use url::form_urlencoded;

pub const STEP_SECS: u64 = 30;
pub const DIGITS: usize = 6;
/// Nombre de pas tolérés de part et d'autre du pas courant.
pub const SKEW_STEPS: u64 = 1;
const SECRET_BYTES: usize = 20;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TotpError {
    #[error("TOTP secret is not valid base32")]
    InvalidSecret,
}

#[derive(Default)]
pub struct TotpEngine {
    /// secret normalisé -> dernier pas accepté
    consumed: Mutex<HashMap<String, u64>>,
}

impl TotpEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 160 bits aléatoires, encodés en base32 sans padding.
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        BASE32_NOPAD.encode(&bytes)
    }

    /// Code à 6 chiffres pour l'instant `timestamp` (secondes Unix).
    pub fn code(secret: &str, timestamp: u64) -> Result<String, TotpError> {
        let key = decode_secret(secret)?;
        hotp(&key, timestamp / STEP_SECS)
    }

    /// Vérifie `submitted` à `timestamp`, pas courant ±1. Enregistre le pas
    /// accepté ; un rejeu sur ce pas ou un pas antérieur est refusé.
    pub fn verify(&self, secret: &str, submitted: &str, timestamp: u64) -> bool {
        let submitted = submitted.trim();
        if submitted.len() != DIGITS || !submitted.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        let Ok(key) = decode_secret(secret) else {
            return false;
        };

        let current = timestamp / STEP_SECS;
        let first = current.saturating_sub(SKEW_STEPS);
        let matched = (first..=current + SKEW_STEPS)
            .filter(|step| {
                hotp(&key, *step)
                    .is_ok_and(|code| bool::from(code.as_bytes().ct_eq(submitted.as_bytes())))
            })
            .last();

        let Some(step) = matched else {
            return false;
        };

        let mut consumed = self.consumed.lock();
        let ledger_key = normalize(secret);
        if consumed.get(&ledger_key).is_some_and(|last| step <= *last) {
            tracing::warn!("rejected replayed TOTP code (step {})", step);
            return false;
        }
        consumed.insert(ledger_key, step);
        true
    }

    /// Oublie l'historique d'un secret (désactivation 2FA).
    pub fn forget(&self, secret: &str) {
        self.consumed.lock().remove(&normalize(secret));
    }

    /// URI `otpauth://` pour le QR code affiché par l'interface.
    pub fn provisioning_uri(secret: &str, account: &str, issuer: &str) -> String {
        let label = format!("{}:{}", encode_label(issuer), encode_label(account));
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("secret", &normalize(secret))
            .append_pair("issuer", issuer)
            .append_pair("algorithm", "SHA1")
            .append_pair("digits", &DIGITS.to_string())
            .append_pair("period", &STEP_SECS.to_string())
            .finish();
        format!("otpauth://totp/{label}?{query}")
    }
}

pub fn unix_now() -> u64 {
    time::OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

fn normalize(secret: &str) -> String {
    secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn decode_secret(secret: &str) -> Result<Vec<u8>, TotpError> {
    let key = BASE32_NOPAD
        .decode(normalize(secret).as_bytes())
        .map_err(|_| TotpError::InvalidSecret)?;
    if key.is_empty() {
        return Err(TotpError::InvalidSecret);
    }
    Ok(key)
}

// RFC 4226 : HMAC-SHA1 + troncature dynamique.
fn hotp(key: &[u8], counter: u64) -> Result<String, TotpError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| TotpError::InvalidSecret)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);

    Ok(format!("{:0width$}", binary % 10u32.pow(DIGITS as u32), width = DIGITS))
}

fn encode_label(part: &str) -> String {
    form_urlencoded::byte_serialize(part.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
