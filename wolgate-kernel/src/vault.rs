//! Coffre du compte admin unique : mot de passe (argon2id) et état 2FA.
//!
//! Toutes les mutations tiennent le même verrou pendant tout le
//! lecture-modification-écriture, et ne remplacent l'enregistrement en
//! mémoire qu'une fois le fichier persisté.

use crate::persist::write_json_atomic;
use crate::totp::{unix_now, TotpEngine};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("current password is incorrect")]
    IncorrectPassword,
    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    WeakPassword,
    #[error("new passwords do not match")]
    PasswordMismatch,
    #[error("no pending 2FA enrollment")]
    NoPendingEnrollment,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Enregistrement persisté du compte admin (`admin_config.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCredential {
    #[serde(default)]
    pub admin_enabled: bool,
    #[serde(default = "default_username")]
    pub admin_username: String,
    #[serde(default)]
    pub admin_password_hash: String,
    #[serde(rename = "2fa_enabled", default)]
    pub totp_enabled: bool,
    /// Vide = absent.
    #[serde(rename = "2fa_secret", default)]
    pub totp_secret: String,
    #[serde(rename = "2fa_pending_secret", default, skip_serializing_if = "Option::is_none")]
    pub totp_pending_secret: Option<String>,
}

fn default_username() -> String {
    "admin".to_string()
}

impl Default for AdminCredential {
    fn default() -> Self {
        Self {
            admin_enabled: false,
            admin_username: default_username(),
            admin_password_hash: String::new(),
            totp_enabled: false,
            totp_secret: String::new(),
            totp_pending_secret: None,
        }
    }
}

/// Secret en attente de confirmation + URI pour le QR code.
#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub secret: String,
    pub provisioning_uri: String,
}

pub struct CredentialVault {
    path: PathBuf,
    issuer: String,
    record: Mutex<AdminCredential>,
    totp: Arc<TotpEngine>,
}

impl CredentialVault {
    /// Charge le compte admin. Fichier absent ou illisible = compte par défaut,
    /// admin désactivé ; rien n'est écrit avant la première mutation.
    pub fn load(path: impl Into<PathBuf>, issuer: impl Into<String>, totp: Arc<TotpEngine>) -> Self {
        let path = path.into();
        let record = match std::fs::read_to_string(&path) {
            Ok(txt) => serde_json::from_str(&txt).unwrap_or_else(|e| {
                warn!("{}: unreadable admin record, using defaults: {}", path.display(), e);
                AdminCredential::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no admin record at {}, admin panel disabled", path.display());
                AdminCredential::default()
            }
            Err(e) => {
                warn!("{}: cannot read admin record, using defaults: {}", path.display(), e);
                AdminCredential::default()
            }
        };

        Self {
            path,
            issuer: issuer.into(),
            record: Mutex::new(record),
            totp,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn admin_enabled(&self) -> bool {
        self.record.lock().admin_enabled
    }

    pub fn username(&self) -> String {
        self.record.lock().admin_username.clone()
    }

    pub fn totp_enabled(&self) -> bool {
        let rec = self.record.lock();
        rec.totp_enabled && !rec.totp_secret.is_empty()
    }

    /// Vrai seulement si identifiant ET mot de passe correspondent. Les deux
    /// comparaisons sont toujours effectuées.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let rec = self.record.lock().clone();
        let user_ok: bool = rec.admin_username.as_bytes().ct_eq(username.as_bytes()).into();
        let pass_ok = verify_password(password, &rec.admin_password_hash);
        user_ok & pass_ok
    }

    /// Code de connexion contre le secret validé.
    pub fn verify_code(&self, code: &str) -> bool {
        self.verify_code_at(code, unix_now())
    }

    pub fn verify_code_at(&self, code: &str, timestamp: u64) -> bool {
        let rec = self.record.lock().clone();
        if !rec.totp_enabled || rec.totp_secret.is_empty() {
            return false;
        }
        self.totp.verify(&rec.totp_secret, code, timestamp)
    }

    /// (Ré)initialise le compte complet, comme une nouvelle installation.
    pub fn setup(&self, username: &str, password: &str, admin_enabled: bool) -> Result<(), VaultError> {
        check_strength(password)?;
        let hash = hash_password(password)?;
        let mut rec = self.record.lock();
        let next = AdminCredential {
            admin_enabled,
            admin_username: username.trim().to_string(),
            admin_password_hash: hash,
            ..AdminCredential::default()
        };
        self.commit(&mut rec, next)?;
        info!("admin account '{}' initialised", rec.admin_username);
        Ok(())
    }

    /// Nouveau hash (sel neuf), sans re-vérification de l'ancien mot de passe.
    pub fn set_password(&self, new_password: &str) -> Result<(), VaultError> {
        let mut rec = self.record.lock();
        self.store_password(&mut rec, new_password)
    }

    /// Changement de mot de passe après re-vérification de l'actuel.
    pub fn change_password(&self, current: &str, new_password: &str) -> Result<(), VaultError> {
        let mut rec = self.record.lock();
        if !verify_password(current, &rec.admin_password_hash) {
            return Err(VaultError::IncorrectPassword);
        }
        self.store_password(&mut rec, new_password)
    }

    fn store_password(&self, rec: &mut AdminCredential, new_password: &str) -> Result<(), VaultError> {
        check_strength(new_password)?;
        let next = AdminCredential {
            admin_password_hash: hash_password(new_password)?,
            ..rec.clone()
        };
        self.commit(rec, next)?;
        info!("admin password changed");
        Ok(())
    }

    /// Génère un secret en attente. `2fa_enabled` ne change pas tant que
    /// `confirm_2fa` n'a pas réussi.
    pub fn begin_enable_2fa(&self) -> Result<Enrollment, VaultError> {
        let secret = TotpEngine::generate_secret();
        let mut rec = self.record.lock();
        let next = AdminCredential {
            totp_pending_secret: Some(secret.clone()),
            ..rec.clone()
        };
        self.commit(&mut rec, next)?;

        let provisioning_uri = TotpEngine::provisioning_uri(&secret, &rec.admin_username, &self.issuer);
        info!("2FA enrollment started");
        Ok(Enrollment { secret, provisioning_uri })
    }

    pub fn confirm_2fa(&self, code: &str) -> Result<bool, VaultError> {
        self.confirm_2fa_at(code, unix_now())
    }

    /// Un code faux laisse le secret en attente pour réessayer.
    pub fn confirm_2fa_at(&self, code: &str, timestamp: u64) -> Result<bool, VaultError> {
        let mut rec = self.record.lock();
        let pending = rec
            .totp_pending_secret
            .clone()
            .ok_or(VaultError::NoPendingEnrollment)?;

        if !self.totp.verify(&pending, code, timestamp) {
            warn!("2FA confirmation failed, enrollment still pending");
            return Ok(false);
        }

        let previous = rec.totp_secret.clone();
        let next = AdminCredential {
            totp_enabled: true,
            totp_secret: pending,
            totp_pending_secret: None,
            ..rec.clone()
        };
        self.commit(&mut rec, next)?;
        if !previous.is_empty() {
            self.totp.forget(&previous);
        }
        info!("2FA enabled");
        Ok(true)
    }

    /// Exige le mot de passe actuel avant d'effacer le secret.
    pub fn disable_2fa(&self, password: &str) -> Result<(), VaultError> {
        let mut rec = self.record.lock();
        if !verify_password(password, &rec.admin_password_hash) {
            return Err(VaultError::IncorrectPassword);
        }
        let previous = rec.totp_secret.clone();
        let next = AdminCredential {
            totp_enabled: false,
            totp_secret: String::new(),
            totp_pending_secret: None,
            ..rec.clone()
        };
        self.commit(&mut rec, next)?;
        if !previous.is_empty() {
            self.totp.forget(&previous);
        }
        info!("2FA disabled");
        Ok(())
    }

    /// Copie de l'enregistrement courant.
    pub fn record(&self) -> AdminCredential {
        self.record.lock().clone()
    }

    fn commit(&self, rec: &mut AdminCredential, next: AdminCredential) -> Result<(), VaultError> {
        write_json_atomic(&self.path, &next)?;
        *rec = next;
        Ok(())
    }
}

fn check_strength(password: &str) -> Result<(), VaultError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(VaultError::WeakPassword);
    }
    Ok(())
}

/// Hash argon2id avec sel aléatoire, format PHC.
pub fn hash_password(password: &str) -> Result<String, VaultError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| VaultError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(dir: &tempfile::TempDir) -> CredentialVault {
        CredentialVault::load(
            dir.path().join("admin_config.json"),
            "WOL Gateway",
            Arc::new(TotpEngine::new()),
        )
    }

    fn ready_vault(dir: &tempfile::TempDir) -> CredentialVault {
        let v = vault(dir);
        v.setup("admin", "correct horse", true).unwrap();
        v
    }

    #[test]
    fn test_password_hashing() {
        let hash = hash_password("test_password_123").unwrap();
        assert_ne!(hash, "test_password_123");
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("test_password_123", &hash));
        assert!(!verify_password("wrong_password", &hash));
        assert!(!verify_password("anything", ""));
    }

    #[test]
    fn test_missing_file_defaults_to_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(&dir);
        assert!(!v.admin_enabled());
        assert_eq!(v.username(), "admin");
        assert!(!v.verify("admin", ""));
        assert!(!v.path().exists());
    }

    #[test]
    fn test_verify_is_generic() {
        let dir = tempfile::tempdir().unwrap();
        let v = ready_vault(&dir);
        assert!(v.verify("admin", "correct horse"));
        assert!(!v.verify("admin", "wrong horse"));
        assert!(!v.verify("root", "correct horse"));
        assert!(!v.verify("", ""));
    }

    #[test]
    fn test_record_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        ready_vault(&dir);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("admin_config.json")).unwrap()).unwrap();
        assert_eq!(raw["admin_enabled"], true);
        assert_eq!(raw["2fa_enabled"], false);
        assert!(raw.get("2fa_pending_secret").is_none());

        let reloaded = vault(&dir);
        assert!(reloaded.admin_enabled());
        assert!(reloaded.verify("admin", "correct horse"));
    }

    #[test]
    fn test_change_password_requires_current() {
        let dir = tempfile::tempdir().unwrap();
        let v = ready_vault(&dir);

        assert!(matches!(
            v.change_password("nope nope", "new password 1"),
            Err(VaultError::IncorrectPassword)
        ));
        assert!(matches!(v.change_password("correct horse", "short"), Err(VaultError::WeakPassword)));

        v.change_password("correct horse", "new password 1").unwrap();
        assert!(v.verify("admin", "new password 1"));
        assert!(!v.verify("admin", "correct horse"));
    }

    #[test]
    fn test_set_password_uses_fresh_salt() {
        let dir = tempfile::tempdir().unwrap();
        let v = ready_vault(&dir);
        let before = v.record();

        assert!(matches!(v.set_password("short"), Err(VaultError::WeakPassword)));
        assert_eq!(v.record(), before);

        v.set_password("another horse").unwrap();
        let first = v.record().admin_password_hash;
        v.set_password("another horse").unwrap();
        let second = v.record().admin_password_hash;
        assert_ne!(first, second);
        assert!(v.verify("admin", "another horse"));
        assert!(!v.verify("admin", "correct horse"));

        // le reste de l'enregistrement est conservé, y compris sur disque
        let reloaded = vault(&dir);
        assert_eq!(reloaded.record().admin_password_hash, second);
        assert!(reloaded.admin_enabled());
    }

    #[test]
    fn test_enrollment_retry_then_confirm() {
        let dir = tempfile::tempdir().unwrap();
        let v = ready_vault(&dir);
        let t = 1_700_000_000;

        assert!(matches!(v.confirm_2fa_at("123456", t), Err(VaultError::NoPendingEnrollment)));

        let enrollment = v.begin_enable_2fa().unwrap();
        assert!(enrollment.provisioning_uri.contains(&enrollment.secret));
        assert!(!v.totp_enabled());

        let good = TotpEngine::code(&enrollment.secret, t).unwrap();
        let typo = if good == "000000" { "111111" } else { "000000" };
        assert!(!v.confirm_2fa_at(typo, t).unwrap());
        assert!(!v.totp_enabled());
        assert_eq!(v.record().totp_pending_secret.as_deref(), Some(enrollment.secret.as_str()));

        assert!(v.confirm_2fa_at(&good, t).unwrap());
        assert!(v.totp_enabled());
        let rec = v.record();
        assert_eq!(rec.totp_secret, enrollment.secret);
        assert!(rec.totp_pending_secret.is_none());

        // le code de confirmation ne peut pas resservir pour se connecter
        assert!(!v.verify_code_at(&good, t));
        let next = TotpEngine::code(&enrollment.secret, t + 30).unwrap();
        assert!(v.verify_code_at(&next, t + 30));
    }

    #[test]
    fn test_reenrollment_keeps_committed_secret() {
        let dir = tempfile::tempdir().unwrap();
        let v = ready_vault(&dir);
        let t = 1_700_000_000;

        let first = v.begin_enable_2fa().unwrap();
        assert!(v.confirm_2fa_at(&TotpEngine::code(&first.secret, t).unwrap(), t).unwrap());

        let second = v.begin_enable_2fa().unwrap();
        assert_eq!(v.record().totp_secret, first.secret);
        assert!(v.totp_enabled());
        assert_ne!(second.secret, first.secret);
    }

    #[test]
    fn test_disable_requires_password() {
        let dir = tempfile::tempdir().unwrap();
        let v = ready_vault(&dir);
        let t = 1_700_000_000;
        let e = v.begin_enable_2fa().unwrap();
        v.confirm_2fa_at(&TotpEngine::code(&e.secret, t).unwrap(), t).unwrap();

        assert!(matches!(v.disable_2fa("hijacked"), Err(VaultError::IncorrectPassword)));
        assert!(v.totp_enabled());

        v.disable_2fa("correct horse").unwrap();
        let rec = v.record();
        assert!(!rec.totp_enabled);
        assert!(rec.totp_secret.is_empty());
        assert!(!v.verify_code_at(&TotpEngine::code(&e.secret, t + 60).unwrap(), t + 60));
    }

    #[test]
    fn test_reads_legacy_record_layout() {
        let dir = tempfile::tempdir().unwrap();
        let hash = hash_password("legacy password").unwrap();
        std::fs::write(
            dir.path().join("admin_config.json"),
            serde_json::json!({
                "admin_enabled": true,
                "admin_username": "ops",
                "admin_password_hash": hash,
                "2fa_enabled": false,
                "2fa_secret": ""
            })
            .to_string(),
        )
        .unwrap();

        let v = vault(&dir);
        assert!(v.admin_enabled());
        assert!(v.verify("ops", "legacy password"));
        assert!(!v.totp_enabled());
    }
}
