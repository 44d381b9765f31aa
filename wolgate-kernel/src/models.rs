/**
 * MODÈLES - Entrées serveur réveillables et adresse MAC canonique
 *
 * RÔLE : Types partagés entre le ConfigStore (persistance) et le WakeDispatcher
 * (construction du magic packet). La validation vit ici pour que les deux
 * chemins appliquent exactement les mêmes règles.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Adresse MAC validée (6 octets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address '{0}': expected six hex pairs separated by ':' or '-'")]
pub struct MacParseError(pub String);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    /// Forme canonique : `00:11:22:33:44:55` ou `00-11-22-33-44-55`.
    /// Un seul type de séparateur par adresse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MacParseError(s.to_string());
        let raw = s.as_bytes();
        if raw.len() != 17 {
            return Err(err());
        }
        let sep = raw[2];
        if sep != b':' && sep != b'-' {
            return Err(err());
        }

        let mut out = [0u8; 6];
        for (i, byte) in out.iter_mut().enumerate() {
            let base = i * 3;
            if i < 5 && raw[base + 2] != sep {
                return Err(err());
            }
            let pair = s.get(base..base + 2).ok_or_else(err)?;
            if !pair.bytes().all(|c| c.is_ascii_hexdigit()) {
                return Err(err());
            }
            *byte = u8::from_str_radix(pair, 16).map_err(|_| err())?;
        }
        Ok(Self(out))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Une machine réveillable telle que persistée dans le fichier serveurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: u32,
    pub name: String,
    pub mac: String,
    #[serde(rename = "broadcast")]
    pub broadcast_addr: String,
    #[serde(rename = "url")]
    pub site_url: String,
    pub wait_seconds: u64,
}

/// Champs saisis côté admin, avant attribution d'un id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDraft {
    pub name: String,
    pub mac: String,
    #[serde(default = "default_broadcast")]
    pub broadcast: String,
    pub url: String,
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,
}

fn default_broadcast() -> String {
    "255.255.255.255".to_string()
}

fn default_wait_seconds() -> u64 {
    60
}

impl ServerDraft {
    pub fn into_entry(self, id: u32) -> ServerEntry {
        ServerEntry {
            id,
            name: self.name.trim().to_string(),
            mac: self.mac.trim().to_string(),
            broadcast_addr: self.broadcast.trim().to_string(),
            site_url: self.url.trim().to_string(),
            wait_seconds: self.wait_seconds,
        }
    }
}

impl ServerEntry {
    /// Vérifie les invariants d'une entrée ; renvoie la raison du rejet.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err(format!("server {}: name is empty", self.id));
        }
        self.mac_address()
            .map_err(|e| format!("server {}: {e}", self.id))?;
        self.broadcast()
            .map_err(|_| format!("server {}: broadcast '{}' is not an IPv4 address", self.id, self.broadcast_addr))?;
        if self.site_url.trim().is_empty() {
            return Err(format!("server {}: url is empty", self.id));
        }
        Ok(())
    }

    pub fn mac_address(&self) -> Result<MacAddress, MacParseError> {
        self.mac.parse()
    }

    pub fn broadcast(&self) -> Result<Ipv4Addr, std::net::AddrParseError> {
        self.broadcast_addr.parse()
    }
}
