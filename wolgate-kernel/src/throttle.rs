//! Limitation des tentatives de connexion, par adresse client et par compte.
//!
//! Fenêtre glissante simple : N échecs dans `window` verrouillent la clé
//! pendant `lockout`. Un succès remet les deux compteurs à zéro.

use crate::sessions::AuthError;
use parking_lot::Mutex;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ThrottlePolicy {
    pub max_failures_per_client: u32,
    pub max_failures_per_account: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_failures_per_client: 5,
            max_failures_per_account: 20,
            window: Duration::minutes(15),
            lockout: Duration::minutes(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Client(String),
    Account(String),
}

#[derive(Debug)]
struct Counter {
    failures: u32,
    window_start: OffsetDateTime,
    locked_until: Option<OffsetDateTime>,
}

pub struct LoginThrottle {
    policy: ThrottlePolicy,
    counters: Mutex<HashMap<Key, Counter>>,
}

impl LoginThrottle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// `RateLimited` si le client ou le compte est verrouillé.
    pub fn check(&self, client: &str, account: &str, now: OffsetDateTime) -> Result<(), AuthError> {
        let counters = self.counters.lock();
        let locked = [client_key(client), account_key(account)].iter().any(|key| {
            counters
                .get(key)
                .and_then(|c| c.locked_until)
                .is_some_and(|until| now < until)
        });
        if locked {
            return Err(AuthError::RateLimited);
        }
        Ok(())
    }

    pub fn record_failure(&self, client: &str, account: &str, now: OffsetDateTime) {
        let mut counters = self.counters.lock();
        let keys = [
            (client_key(client), self.policy.max_failures_per_client),
            (account_key(account), self.policy.max_failures_per_account),
        ];
        for (key, max) in keys {
            let counter = counters.entry(key.clone()).or_insert(Counter {
                failures: 0,
                window_start: now,
                locked_until: None,
            });
            if now - counter.window_start > self.policy.window {
                counter.failures = 0;
                counter.window_start = now;
                counter.locked_until = None;
            }
            counter.failures += 1;
            if counter.failures >= max && counter.locked_until.is_none() {
                counter.locked_until = Some(now + self.policy.lockout);
                warn!("login locked for {:?} after {} failures", key, counter.failures);
            }
        }
    }

    pub fn record_success(&self, client: &str, account: &str) {
        let mut counters = self.counters.lock();
        counters.remove(&client_key(client));
        counters.remove(&account_key(account));
    }

    /// Supprime les compteurs périmés (fenêtre et verrou écoulés).
    pub fn prune(&self, now: OffsetDateTime) -> usize {
        let mut counters = self.counters.lock();
        let before = counters.len();
        counters.retain(|_, c| {
            let window_open = now - c.window_start <= self.policy.window;
            let locked = c.locked_until.is_some_and(|until| now < until);
            window_open || locked
        });
        before - counters.len()
    }
}

fn client_key(client: &str) -> Key {
    Key::Client(client.to_string())
}

fn account_key(account: &str) -> Key {
    Key::Account(account.trim().to_lowercase())
}
