//! Réglages d'exécution (YAML). Le contenu des serveurs et le compte admin
//! vivent dans leurs propres fichiers JSON, voir `config` et `vault`.

use crate::sessions::SessionPolicy;
use crate::throttle::ThrottlePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use time::Duration;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "wolgate.yaml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen: String,
    pub servers_file: PathBuf,
    pub admin_file: PathBuf,
    /// Émetteur affiché dans l'application d'authentification.
    pub issuer: String,
    pub cookie_secure: bool,
    pub session: SessionConf,
    pub throttle: ThrottleConf,
    pub wake: WakeConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConf {
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub challenge_ttl_secs: u64,
    pub max_code_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConf {
    pub max_failures_per_client: u32,
    pub max_failures_per_account: u32,
    pub window_secs: u64,
    pub lockout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConf {
    pub port: u16,
    /// Nombre total d'envois par demande de réveil (1 = un seul paquet).
    pub repeat: u32,
    pub repeat_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".into(),
            servers_file: "servers.json".into(),
            admin_file: "admin_config.json".into(),
            issuer: "WOL Gateway".into(),
            cookie_secure: false,
            session: SessionConf::default(),
            throttle: ThrottleConf::default(),
            wake: WakeConf::default(),
        }
    }
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 900,
            max_lifetime_secs: 8 * 3600,
            challenge_ttl_secs: 300,
            max_code_attempts: 5,
        }
    }
}

impl Default for ThrottleConf {
    fn default() -> Self {
        Self {
            max_failures_per_client: 5,
            max_failures_per_account: 20,
            window_secs: 900,
            lockout_secs: 900,
        }
    }
}

impl Default for WakeConf {
    fn default() -> Self {
        Self {
            port: crate::wol::DEFAULT_PORT,
            repeat: 1,
            repeat_interval_ms: 200,
        }
    }
}

impl SessionConf {
    pub fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            idle_timeout: secs(self.idle_timeout_secs),
            max_lifetime: secs(self.max_lifetime_secs),
            challenge_ttl: secs(self.challenge_ttl_secs),
            max_code_attempts: self.max_code_attempts.max(1),
        }
    }
}

impl ThrottleConf {
    pub fn policy(&self) -> ThrottlePolicy {
        ThrottlePolicy {
            max_failures_per_client: self.max_failures_per_client.max(1),
            max_failures_per_account: self.max_failures_per_account.max(1),
            window: secs(self.window_secs),
            lockout: secs(self.lockout_secs),
        }
    }
}

impl WakeConf {
    pub fn interval(&self) -> StdDuration {
        StdDuration::from_millis(self.repeat_interval_ms)
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

impl Settings {
    /// Chemin depuis `WOLGATE_CONFIG`, sinon `wolgate.yaml`.
    pub fn load() -> Result<Self, SettingsError> {
        let path = std::env::var("WOLGATE_CONFIG").unwrap_or_else(|_| DEFAULT_SETTINGS_FILE.into());
        Self::load_from(Path::new(&path))
    }

    /// Fichier absent ou vide : défauts. Fichier illisible : erreur.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let txt = match std::fs::read_to_string(path) {
            Ok(txt) => txt,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("no {} found, using default settings", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io { path: path.to_path_buf(), source });
            }
        };
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&txt).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
