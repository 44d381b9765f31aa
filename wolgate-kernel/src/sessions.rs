/**
 * SESSION MANAGER - Machine d'état de connexion admin
 *
 * ÉTATS :
 *   Anonymous ──mot de passe OK──▶ PasswordOk ──code 2FA OK──▶ Authenticated
 *        ▲                              │
 *        └──── échec / expiration ──────┘
 *
 * - sans 2FA, un mot de passe correct mène directement à Authenticated
 * - un jeton PasswordOk (challenge) n'est JAMAIS accepté par `authorize`
 * - sessions en mémoire uniquement : un redémarrage les détruit toutes
 * - expiration glissante (inactivité) bornée par une durée de vie absolue
 */

use crate::throttle::{LoginThrottle, ThrottlePolicy};
use crate::vault::CredentialVault;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

const TOKEN_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    Anonymous,
    PasswordOk,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    BadCredentials,
    #[error("invalid verification code")]
    BadCode,
    #[error("too many failed attempts, try again later")]
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session is invalid")]
    Invalid,
    #[error("session has expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub stage: SessionStage,
    pub created_at: OffsetDateTime,
    pub last_activity_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub challenge_ttl: Duration,
    pub max_code_attempts: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::minutes(15),
            max_lifetime: Duration::hours(8),
            challenge_ttl: Duration::minutes(5),
            max_code_attempts: 5,
        }
    }
}

#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated(Session),
    /// Mot de passe accepté, code 2FA attendu. `rejected` : un code a été
    /// fourni avec la requête et il était faux.
    CodeRequired { challenge: String, rejected: bool },
}

struct Entry {
    session: Session,
    code_attempts: u32,
}

pub struct SessionManager {
    vault: Arc<CredentialVault>,
    throttle: LoginThrottle,
    policy: SessionPolicy,
    table: Mutex<HashMap<String, Entry>>,
}

impl SessionManager {
    pub fn new(vault: Arc<CredentialVault>, policy: SessionPolicy, throttle: ThrottlePolicy) -> Self {
        Self {
            vault,
            throttle: LoginThrottle::new(throttle),
            policy,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn login(
        &self,
        client: &str,
        username: &str,
        password: &str,
        code: Option<&str>,
    ) -> Result<LoginOutcome, AuthError> {
        self.login_at(client, username, password, code, OffsetDateTime::now_utc())
    }

    pub fn login_at(
        &self,
        client: &str,
        username: &str,
        password: &str,
        code: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<LoginOutcome, AuthError> {
        self.throttle.check(client, username, now)?;

        if !self.vault.verify(username, password) {
            self.throttle.record_failure(client, username, now);
            warn!("failed admin login from {}", client);
            return Err(AuthError::BadCredentials);
        }

        if !self.vault.totp_enabled() {
            self.throttle.record_success(client, username);
            let session = self.issue(now);
            info!("admin logged in from {}", client);
            return Ok(LoginOutcome::Authenticated(session));
        }

        match code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) if self.vault.verify_code_at(code, unix_seconds(now)) => {
                self.throttle.record_success(client, username);
                let session = self.issue(now);
                info!("admin logged in with 2FA from {}", client);
                Ok(LoginOutcome::Authenticated(session))
            }
            Some(_) => {
                self.throttle.record_failure(client, username, now);
                warn!("bad 2FA code from {}", client);
                let challenge = self.open_challenge(now, 1);
                Ok(LoginOutcome::CodeRequired { challenge, rejected: true })
            }
            None => {
                let challenge = self.open_challenge(now, 0);
                Ok(LoginOutcome::CodeRequired { challenge, rejected: false })
            }
        }
    }

    /// Second facteur sur un challenge PasswordOk. En cas de succès le
    /// challenge est détruit et un NOUVEAU jeton est émis.
    pub fn submit_code(&self, client: &str, challenge: &str, code: &str) -> Result<Session, AuthError> {
        self.submit_code_at(client, challenge, code, OffsetDateTime::now_utc())
    }

    pub fn submit_code_at(
        &self,
        client: &str,
        challenge: &str,
        code: &str,
        now: OffsetDateTime,
    ) -> Result<Session, AuthError> {
        let account = self.vault.username();
        self.throttle.check(client, &account, now)?;

        let mut table = self.table.lock();
        let live = match table.get(challenge) {
            Some(e) if e.session.stage == SessionStage::PasswordOk => now <= e.session.expires_at,
            _ => return Err(AuthError::BadCredentials),
        };
        if !live {
            table.remove(challenge);
            return Err(AuthError::BadCredentials);
        }

        if self.vault.verify_code_at(code.trim(), unix_seconds(now)) {
            table.remove(challenge);
            let session = self.new_session(now);
            table.insert(
                session.token.clone(),
                Entry { session: session.clone(), code_attempts: 0 },
            );
            self.throttle.record_success(client, &account);
            info!("admin logged in with 2FA from {}", client);
            return Ok(session);
        }

        self.throttle.record_failure(client, &account, now);
        if let Some(entry) = table.get_mut(challenge) {
            entry.code_attempts += 1;
            if entry.code_attempts >= self.policy.max_code_attempts {
                table.remove(challenge);
                warn!("2FA challenge discarded after too many bad codes from {}", client);
            }
        }
        Err(AuthError::BadCode)
    }

    /// Re-vérification du mot de passe depuis une session ouverte
    /// (changement de mot de passe, désactivation 2FA) : même verrouillage
    /// que la connexion.
    pub fn check_reverify(&self, client: &str) -> Result<(), AuthError> {
        self.throttle.check(client, &self.vault.username(), OffsetDateTime::now_utc())
    }

    pub fn record_reverify(&self, client: &str, accepted: bool) {
        let account = self.vault.username();
        if accepted {
            self.throttle.record_success(client, &account);
        } else {
            self.throttle.record_failure(client, &account, OffsetDateTime::now_utc());
            warn!("wrong current password from {}", client);
        }
    }

    /// Durée de vie absolue d'une session, utilisée pour le cookie.
    pub fn max_lifetime(&self) -> Duration {
        self.policy.max_lifetime
    }

    pub fn authorize(&self, token: &str) -> Result<Session, SessionError> {
        self.authorize_at(token, OffsetDateTime::now_utc())
    }

    /// Valide un jeton Authenticated et rafraîchit son activité.
    pub fn authorize_at(&self, token: &str, now: OffsetDateTime) -> Result<Session, SessionError> {
        let mut table = self.table.lock();
        let expired = match table.get(token) {
            Some(e) if e.session.stage == SessionStage::Authenticated => self.is_expired(&e.session, now),
            _ => return Err(SessionError::Invalid),
        };
        if expired {
            table.remove(token);
            return Err(SessionError::Expired);
        }

        let entry = table.get_mut(token).ok_or(SessionError::Invalid)?;
        let session = &mut entry.session;
        session.last_activity_at = now;
        session.expires_at = self.expiry_for(session.created_at, now);
        Ok(session.clone())
    }

    /// Étape atteinte par un jeton ; inconnu = Anonymous.
    pub fn stage(&self, token: &str) -> SessionStage {
        self.table
            .lock()
            .get(token)
            .map_or(SessionStage::Anonymous, |e| e.session.stage)
    }

    pub fn logout(&self, token: &str) -> bool {
        let removed = self.table.lock().remove(token).is_some();
        if removed {
            info!("admin session closed");
        }
        removed
    }

    /// Ferme toutes les sessions sauf `keep` (après changement de mot de passe).
    pub fn revoke_others(&self, keep: &str) -> usize {
        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|token, _| token == keep);
        before - table.len()
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(OffsetDateTime::now_utc())
    }

    pub fn purge_expired_at(&self, now: OffsetDateTime) -> usize {
        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|_, e| match e.session.stage {
            SessionStage::Authenticated => !self.is_expired(&e.session, now),
            _ => now <= e.session.expires_at,
        });
        self.throttle.prune(now);
        before - table.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|e| e.session.stage == SessionStage::Authenticated)
            .count()
    }

    fn issue(&self, now: OffsetDateTime) -> Session {
        let session = self.new_session(now);
        self.table.lock().insert(
            session.token.clone(),
            Entry { session: session.clone(), code_attempts: 0 },
        );
        session
    }

    fn new_session(&self, now: OffsetDateTime) -> Session {
        Session {
            token: generate_token(),
            stage: SessionStage::Authenticated,
            created_at: now,
            last_activity_at: now,
            expires_at: self.expiry_for(now, now),
        }
    }

    fn open_challenge(&self, now: OffsetDateTime, code_attempts: u32) -> String {
        let token = generate_token();
        let session = Session {
            token: token.clone(),
            stage: SessionStage::PasswordOk,
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.policy.challenge_ttl,
        };
        self.table.lock().insert(token.clone(), Entry { session, code_attempts });
        token
    }

    fn is_expired(&self, session: &Session, now: OffsetDateTime) -> bool {
        now - session.last_activity_at > self.policy.idle_timeout
            || now - session.created_at > self.policy.max_lifetime
    }

    fn expiry_for(&self, created_at: OffsetDateTime, last_activity: OffsetDateTime) -> OffsetDateTime {
        (last_activity + self.policy.idle_timeout).min(created_at + self.policy.max_lifetime)
    }
}

fn generate_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn unix_seconds(now: OffsetDateTime) -> u64 {
    now.unix_timestamp().max(0) as u64
}
