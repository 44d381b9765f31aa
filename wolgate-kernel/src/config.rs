/**
 * CONFIG STORE - Liste des serveurs réveillables + drapeau admin
 *
 * RÔLE :
 * Charge et valide le fichier serveurs au démarrage, expose un snapshot
 * immuable servi à toutes les requêtes, et persiste les modifications admin.
 *
 * FONCTIONNEMENT :
 * - `load` construit UNE FOIS le snapshot (Arc partagé, jamais muté)
 * - une entrée invalide est écartée avec un warning, le reste reste servi
 * - fichier absent / JSON illisible = erreur fatale, le kernel ne démarre pas
 * - `write` passe par fichier temporaire + fsync + rename (voir persist.rs)
 * - une écriture ne touche PAS le snapshot : effet au prochain redémarrage
 * - le CRUD admin travaille sur les entrées brutes : une entrée invalide sur
 *   disque est conservée telle quelle, seule l'entrée ciblée est réécrite
 */

use crate::models::{ServerDraft, ServerEntry};
use crate::persist::write_json_atomic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    Missing(PathBuf),
    #[error("configuration file is malformed: {0}")]
    Malformed(String),
    #[error("invalid server entry: {0}")]
    InvalidEntry(String),
    #[error("unknown server id {0}")]
    UnknownServer(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Emplacements des deux fichiers persistés.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub servers_path: PathBuf,
    pub admin_path: PathBuf,
}

/// Vue immuable de la configuration, figée au démarrage du process.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub servers: Vec<ServerEntry>,
    pub admin_enabled: bool,
    /// Raisons des entrées écartées au chargement.
    pub dropped: Vec<String>,
}

impl ConfigSnapshot {
    pub fn get(&self, id: u32) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn first(&self) -> Option<&ServerEntry> {
        self.servers.first()
    }
}

/// Accusé d'écriture : toute modification exige un redémarrage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub version: u64,
    pub restart_required: bool,
}

#[derive(Deserialize)]
struct ServersFileIn {
    #[serde(default)]
    version: u64,
    servers: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct ServersFileOut<'a> {
    version: u64,
    servers: &'a [serde_json::Value],
}

#[derive(Deserialize)]
struct AdminFlag {
    #[serde(default)]
    admin_enabled: bool,
}

pub struct ConfigStore {
    source: ConfigSource,
    snapshot: Arc<ConfigSnapshot>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Charge et valide la configuration. Échoue si le fichier serveurs est
    /// absent ou illisible ; les entrées invalides sont seulement écartées.
    pub fn load(source: ConfigSource) -> Result<Self, ConfigError> {
        let (version, servers, dropped) = read_servers(&source.servers_path)?;
        let admin_enabled = read_admin_flag(&source.admin_path);

        info!(
            "loaded {} servers (version {}, {} dropped) from {}",
            servers.len(),
            version,
            dropped.len(),
            source.servers_path.display()
        );

        let snapshot = ConfigSnapshot { version, servers, admin_enabled, dropped };
        Ok(Self {
            source,
            snapshot: Arc::new(snapshot),
            write_lock: Mutex::new(()),
        })
    }

    /// Snapshot servi aux requêtes ; identique pendant toute la vie du process.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Lecture en mémoire uniquement, jamais de disque.
    pub fn get(&self, id: u32) -> Option<ServerEntry> {
        self.snapshot.get(id).cloned()
    }

    /// Liste telle qu'elle est sur disque (côté admin, peut différer du snapshot).
    pub fn persisted(&self) -> Result<Vec<ServerEntry>, ConfigError> {
        read_servers(&self.source.servers_path).map(|(_, servers, _)| servers)
    }

    /// Vrai si une écriture a eu lieu depuis le démarrage.
    pub fn pending_restart(&self) -> Result<bool, ConfigError> {
        let file = read_file(&self.source.servers_path)?;
        Ok(file.version != self.snapshot.version)
    }

    /// Remplace la liste persistée. Le snapshot en mémoire n'est pas modifié.
    pub fn write(&self, list: &[ServerEntry]) -> Result<WriteReceipt, ConfigError> {
        let mut ids = HashSet::new();
        for entry in list {
            entry.validate().map_err(ConfigError::InvalidEntry)?;
            if !ids.insert(entry.id) {
                return Err(ConfigError::InvalidEntry(format!("duplicate server id {}", entry.id)));
            }
        }
        let raw = list.iter().map(to_raw).collect::<Result<Vec<_>, _>>()?;

        let _guard = self.write_lock.lock();
        let current = read_file(&self.source.servers_path).ok().map(|f| f.version);
        self.persist(current, &raw)
    }

    pub fn add_server(&self, draft: ServerDraft) -> Result<(ServerEntry, WriteReceipt), ConfigError> {
        let _guard = self.write_lock.lock();
        let mut file = read_file(&self.source.servers_path)?;
        let id = file
            .servers
            .iter()
            .filter_map(raw_id)
            .max()
            .map_or(1, |max| max + 1);
        let entry = draft.into_entry(id);
        entry.validate().map_err(ConfigError::InvalidEntry)?;

        file.servers.push(to_raw(&entry)?);
        let receipt = self.persist(Some(file.version), &file.servers)?;
        info!("server {} ({}) added", entry.id, entry.name);
        Ok((entry, receipt))
    }

    /// Réécrit l'entrée `id`, même si sa version sur disque était invalide.
    pub fn update_server(&self, id: u32, draft: ServerDraft) -> Result<(ServerEntry, WriteReceipt), ConfigError> {
        let _guard = self.write_lock.lock();
        let mut file = read_file(&self.source.servers_path)?;
        let entry = draft.into_entry(id);
        entry.validate().map_err(ConfigError::InvalidEntry)?;

        let slot = file
            .servers
            .iter_mut()
            .find(|raw| raw_id(raw) == Some(id))
            .ok_or(ConfigError::UnknownServer(id))?;
        *slot = to_raw(&entry)?;
        let receipt = self.persist(Some(file.version), &file.servers)?;
        info!("server {} ({}) updated", entry.id, entry.name);
        Ok((entry, receipt))
    }

    /// Retire l'entrée `id` et la renvoie telle qu'elle était sur disque.
    pub fn delete_server(&self, id: u32) -> Result<(serde_json::Value, WriteReceipt), ConfigError> {
        let _guard = self.write_lock.lock();
        let mut file = read_file(&self.source.servers_path)?;
        let pos = file
            .servers
            .iter()
            .position(|raw| raw_id(raw) == Some(id))
            .ok_or(ConfigError::UnknownServer(id))?;
        let removed = file.servers.remove(pos);
        let receipt = self.persist(Some(file.version), &file.servers)?;
        info!("server {} deleted", id);
        Ok((removed, receipt))
    }

    // Appelé avec write_lock tenu.
    fn persist(&self, on_disk: Option<u64>, servers: &[serde_json::Value]) -> Result<WriteReceipt, ConfigError> {
        let current = on_disk.unwrap_or(self.snapshot.version);
        let version = current.max(self.snapshot.version) + 1;

        let file = ServersFileOut { version, servers };
        write_json_atomic(&self.source.servers_path, &file)?;
        info!(
            "persisted {} servers as version {} (restart required)",
            servers.len(),
            version
        );

        Ok(WriteReceipt { version, restart_required: true })
    }
}

fn raw_id(raw: &serde_json::Value) -> Option<u32> {
    raw.get("id")
        .and_then(serde_json::Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
}

fn to_raw(entry: &ServerEntry) -> Result<serde_json::Value, ConfigError> {
    serde_json::to_value(entry).map_err(|e| ConfigError::Io(e.into()))
}

fn read_file(path: &Path) -> Result<ServersFileIn, ConfigError> {
    let txt = match std::fs::read_to_string(path) {
        Ok(txt) => txt,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };
    serde_json::from_str(&txt).map_err(|e| ConfigError::Malformed(e.to_string()))
}

fn read_servers(path: &Path) -> Result<(u64, Vec<ServerEntry>, Vec<String>), ConfigError> {
    let file = read_file(path)?;

    let mut servers = Vec::with_capacity(file.servers.len());
    let mut dropped = Vec::new();
    let mut ids = HashSet::new();

    for (pos, raw) in file.servers.into_iter().enumerate() {
        let entry = match serde_json::from_value::<ServerEntry>(raw) {
            Ok(entry) => entry,
            Err(e) => {
                dropped.push(format!("entry #{pos}: {e}"));
                continue;
            }
        };
        if let Err(reason) = entry.validate() {
            dropped.push(reason);
            continue;
        }
        if !ids.insert(entry.id) {
            dropped.push(format!("entry #{pos}: duplicate server id {}", entry.id));
            continue;
        }
        servers.push(entry);
    }

    for reason in &dropped {
        warn!("{}: {}", path.display(), ConfigError::InvalidEntry(reason.clone()));
    }

    Ok((file.version, servers, dropped))
}

/// Le compte admin est optionnel : absent ou illisible = admin désactivé.
fn read_admin_flag(path: &Path) -> bool {
    let Ok(txt) = std::fs::read_to_string(path) else {
        return false;
    };
    match serde_json::from_str::<AdminFlag>(&txt) {
        Ok(flag) => flag.admin_enabled,
        Err(e) => {
            warn!("{}: unreadable admin record, admin panel disabled: {}", path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: u32, name: &str, last_octet: u8) -> ServerEntry {
        ServerEntry {
            id,
            name: name.to_string(),
            mac: format!("00:11:22:33:44:{last_octet:02x}"),
            broadcast_addr: "192.168.1.255".to_string(),
            site_url: format!("https://{name}.example.org"),
            wait_seconds: 45,
        }
    }

    fn source(dir: &TempDir) -> ConfigSource {
        ConfigSource {
            servers_path: dir.path().join("servers.json"),
            admin_path: dir.path().join("admin_config.json"),
        }
    }

    fn seed(dir: &TempDir, body: serde_json::Value) -> ConfigSource {
        let src = source(dir);
        std::fs::write(&src.servers_path, body.to_string()).unwrap();
        src
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigStore::load(source(&dir)).err().unwrap();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&dir);
        std::fs::write(&src.servers_path, "{ not json").unwrap();
        assert!(matches!(ConfigStore::load(src).err().unwrap(), ConfigError::Malformed(_)));

        let src = seed(&dir, serde_json::json!({"version": 1}));
        assert!(matches!(ConfigStore::load(src).err().unwrap(), ConfigError::Malformed(_)));
    }

    #[test]
    fn test_invalid_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let src = seed(
            &dir,
            serde_json::json!({
                "version": 3,
                "servers": [
                    {"id": 1, "name": "nas", "mac": "00:11:22:33:44:55", "broadcast": "192.168.1.255", "url": "http://nas", "wait_seconds": 10},
                    {"id": 2, "name": "bad-mac", "mac": "zz:11:22:33:44:55", "broadcast": "192.168.1.255", "url": "http://x", "wait_seconds": 10},
                    {"id": 3, "name": "bad-ip", "mac": "00:11:22:33:44:56", "broadcast": "300.1.1.1", "url": "http://y", "wait_seconds": 10},
                    {"id": 4, "name": "neg-wait", "mac": "00:11:22:33:44:57", "broadcast": "10.0.0.255", "url": "http://z", "wait_seconds": -5},
                    {"id": 1, "name": "dup", "mac": "00:11:22:33:44:58", "broadcast": "10.0.0.255", "url": "http://w", "wait_seconds": 0},
                    {"id": 5, "name": "pc", "mac": "aa-bb-cc-dd-ee-ff", "broadcast": "10.0.0.255", "url": "http://pc", "wait_seconds": 0}
                ]
            }),
        );

        let store = ConfigStore::load(src).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.version, 3);
        assert_eq!(snap.servers.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 5]);
        assert_eq!(snap.dropped.len(), 4);
        assert!(!snap.admin_enabled);
    }

    #[test]
    fn test_admin_flag_read_from_admin_record() {
        let dir = tempfile::tempdir().unwrap();
        let src = seed(&dir, serde_json::json!({"servers": []}));
        std::fs::write(&src.admin_path, r#"{"admin_enabled": true, "admin_username": "admin"}"#).unwrap();
        assert!(ConfigStore::load(src.clone()).unwrap().snapshot().admin_enabled);

        std::fs::write(&src.admin_path, "garbage").unwrap();
        assert!(!ConfigStore::load(src).unwrap().snapshot().admin_enabled);
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = seed(&dir, serde_json::json!({"servers": []}));
        let store = ConfigStore::load(src.clone()).unwrap();

        let list = vec![entry(1, "nas", 0x55), entry(2, "pc", 0x56), entry(7, "lab", 0x57)];
        let receipt = store.write(&list).unwrap();
        assert!(receipt.restart_required);
        assert_eq!(receipt.version, 1);

        let reloaded = ConfigStore::load(src).unwrap();
        assert_eq!(reloaded.snapshot().servers, list);
        assert_eq!(reloaded.snapshot().version, 1);
    }

    #[test]
    fn test_write_does_not_touch_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let src = seed(&dir, serde_json::json!({"servers": []}));
        let store = ConfigStore::load(src).unwrap();
        let before = store.snapshot();

        store.write(&[entry(1, "nas", 0x55)]).unwrap();

        assert!(store.get(1).is_none());
        assert!(store.snapshot().servers.is_empty());
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
        assert!(store.pending_restart().unwrap());
        assert_eq!(store.persisted().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let src = seed(&dir, serde_json::json!({"servers": []}));
        let store = ConfigStore::load(src.clone()).unwrap();
        store.write(&[entry(1, "nas", 0x55), entry(2, "pc", 0x56), entry(3, "lab", 0x57)]).unwrap();

        let (removed, receipt) = store.delete_server(2).unwrap();
        assert_eq!(removed["name"], "pc");
        assert!(receipt.restart_required);

        let reloaded = ConfigStore::load(src).unwrap();
        assert_eq!(
            reloaded.snapshot().servers,
            vec![entry(1, "nas", 0x55), entry(3, "lab", 0x57)]
        );
        assert!(matches!(store.delete_server(2), Err(ConfigError::UnknownServer(2))));
    }

    #[test]
    fn test_admin_edits_keep_invalid_entries_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let broken = serde_json::json!({
            "id": 3, "name": "typo", "mac": "00:11:22:33:44:5G",
            "broadcast": "192.168.1.255", "url": "http://typo", "wait_seconds": 10
        });
        let garbage = serde_json::json!({"name": "no id at all"});
        let src = seed(
            &dir,
            serde_json::json!({
                "version": 1,
                "servers": [
                    serde_json::to_value(entry(1, "nas", 0x55)).unwrap(),
                    serde_json::to_value(entry(2, "pc", 0x56)).unwrap(),
                    broken.clone(),
                    garbage.clone()
                ]
            }),
        );
        let store = ConfigStore::load(src.clone()).unwrap();
        assert_eq!(store.snapshot().dropped.len(), 2);

        store.delete_server(2).unwrap();
        let on_disk = || -> Vec<serde_json::Value> {
            let raw: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(&src.servers_path).unwrap()).unwrap();
            raw["servers"].as_array().unwrap().clone()
        };
        let after_delete = on_disk();
        assert_eq!(after_delete.len(), 3);
        assert_eq!(after_delete[1], broken);
        assert_eq!(after_delete[2], garbage);

        // la nouvelle id passe après l'entrée invalide
        let draft = ServerDraft {
            name: "lab".to_string(),
            mac: "00:11:22:33:44:57".to_string(),
            broadcast: "192.168.1.255".to_string(),
            url: "http://lab".to_string(),
            wait_seconds: 5,
        };
        let (added, _) = store.add_server(draft.clone()).unwrap();
        assert_eq!(added.id, 4);
        assert_eq!(on_disk().len(), 4);

        // corriger l'entrée invalide la remplace sur place
        let (fixed, _) = store.update_server(3, draft).unwrap();
        assert_eq!(fixed.id, 3);
        let after_update = on_disk();
        assert_eq!(after_update[1], serde_json::to_value(&fixed).unwrap());
        assert_eq!(after_update[2], garbage);

        let reloaded = ConfigStore::load(src).unwrap();
        assert_eq!(reloaded.snapshot().servers.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 3, 4]);
    }

    #[test]
    fn test_add_rejects_invalid_draft() {
        let dir = tempfile::tempdir().unwrap();
        let src = seed(&dir, serde_json::json!({"version": 1, "servers": []}));
        let store = ConfigStore::load(src).unwrap();
        let bad = ServerDraft {
            name: "x".to_string(),
            mac: "00:11:22".to_string(),
            broadcast: "192.168.1.255".to_string(),
            url: "http://x".to_string(),
            wait_seconds: 0,
        };
        assert!(matches!(store.add_server(bad), Err(ConfigError::InvalidEntry(_))));
        assert!(!store.pending_restart().unwrap());
    }

    #[test]
    fn test_add_and_update_use_persisted_list() {
        let dir = tempfile::tempdir().unwrap();
        let src = seed(&dir, serde_json::json!({"servers": []}));
        let store = ConfigStore::load(src).unwrap();

        let draft = |name: &str| ServerDraft {
            name: name.to_string(),
            mac: "00:11:22:33:44:55".to_string(),
            broadcast: "192.168.0.255".to_string(),
            url: "http://host".to_string(),
            wait_seconds: 20,
        };

        let (first, _) = store.add_server(draft("one")).unwrap();
        let (second, receipt) = store.add_server(draft("two")).unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(receipt.version, 2);

        let (updated, _) = store.update_server(1, draft("uno")).unwrap();
        assert_eq!(updated.name, "uno");
        assert_eq!(store.persisted().unwrap().len(), 2);
        assert!(matches!(store.update_server(9, draft("x")), Err(ConfigError::UnknownServer(9))));
    }

    #[test]
    fn test_write_rejects_invalid_list() {
        let dir = tempfile::tempdir().unwrap();
        let src = seed(&dir, serde_json::json!({"servers": []}));
        let store = ConfigStore::load(src).unwrap();

        let mut bad = entry(1, "nas", 0x55);
        bad.mac = "nope".into();
        assert!(matches!(store.write(&[bad]), Err(ConfigError::InvalidEntry(_))));
        assert!(matches!(
            store.write(&[entry(1, "a", 1), entry(1, "b", 2)]),
            Err(ConfigError::InvalidEntry(_))
        ));
        assert!(!store.pending_restart().unwrap());
    }
}
