/*!
Builders pour les fichiers JSON lus par le gateway

- `servers.json` : `{"version": n, "servers": [...]}`
- `admin_config.json` : compte admin minimal (sans mot de passe)
*/

use serde::Serialize;
use serde_json::{json, Value};

/// Entrée serveur telle qu'écrite sur disque.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFixture {
    pub id: u32,
    pub name: String,
    pub mac: String,
    pub broadcast: String,
    pub url: String,
    pub wait_seconds: u64,
}

impl ServerFixture {
    /// Valeurs valides par défaut, MAC dérivée de l'id.
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            mac: format!("02:00:00:00:00:{:02x}", id % 256),
            broadcast: "255.255.255.255".to_string(),
            url: format!("http://{}.lan", name.to_lowercase()),
            wait_seconds: 30,
        }
    }

    pub fn mac(mut self, mac: &str) -> Self {
        self.mac = mac.to_string();
        self
    }

    pub fn broadcast(mut self, addr: &str) -> Self {
        self.broadcast = addr.to_string();
        self
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    pub fn wait_seconds(mut self, secs: u64) -> Self {
        self.wait_seconds = secs;
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub fn servers_document(version: u64, servers: &[ServerFixture]) -> Value {
    let list: Vec<Value> = servers.iter().map(ServerFixture::to_json).collect();
    json!({ "version": version, "servers": list })
}

/// Enregistrement admin sans hash : aucun mot de passe ne le valide.
pub fn admin_record(enabled: bool, username: &str) -> Value {
    json!({
        "admin_enabled": enabled,
        "admin_username": username,
        "admin_password_hash": "",
        "2fa_enabled": false,
        "2fa_secret": "",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_builder() {
        let server = ServerFixture::new(7, "NAS")
            .mac("aa:bb:cc:dd:ee:ff")
            .broadcast("127.0.0.1")
            .wait_seconds(90);
        let value = server.to_json();
        assert_eq!(value["id"], 7);
        assert_eq!(value["mac"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(value["broadcast"], "127.0.0.1");
        assert_eq!(value["url"], "http://nas.lan");
        assert_eq!(value["wait_seconds"], 90);
    }

    #[test]
    fn test_servers_document_shape() {
        let doc = servers_document(3, &[ServerFixture::new(1, "a"), ServerFixture::new(2, "b")]);
        assert_eq!(doc["version"], 3);
        assert_eq!(doc["servers"].as_array().map(Vec::len), Some(2));
        assert_eq!(doc["servers"][1]["mac"], "02:00:00:00:00:02");
    }
}
