/*!
Test Harness pour le gateway

Facilite l'écriture de tests d'intégration avec:
- Répertoire temporaire contenant servers.json et admin_config.json
- Capture UDP prête à recevoir les magic packets
*/

use crate::fixtures::{admin_record, servers_document, ServerFixture};
use crate::udp_capture::PacketCapture;
use anyhow::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestHarness {
    pub capture: PacketCapture,
    dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        env_logger::try_init().ok(); // logs pour les tests

        Ok(Self {
            capture: PacketCapture::bind().await?,
            dir: tempfile::tempdir()?,
        })
    }

    pub fn servers_path(&self) -> PathBuf {
        self.dir.path().join("servers.json")
    }

    pub fn admin_path(&self) -> PathBuf {
        self.dir.path().join("admin_config.json")
    }

    /// Serveurs pointés vers la capture loopback.
    pub fn loopback_server(&self, id: u32, name: &str) -> ServerFixture {
        ServerFixture::new(id, name).broadcast("127.0.0.1")
    }

    pub fn write_servers(&self, version: u64, servers: &[ServerFixture]) -> Result<()> {
        self.write_json(&self.servers_path(), &servers_document(version, servers))
    }

    pub fn write_admin(&self, enabled: bool, username: &str) -> Result<()> {
        self.write_json(&self.admin_path(), &admin_record(enabled, username))
    }

    pub fn read_servers(&self) -> Result<Value> {
        let txt = std::fs::read_to_string(self.servers_path())?;
        Ok(serde_json::from_str(&txt)?)
    }

    fn write_json(&self, path: &Path, value: &Value) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
        log::info!("wrote fixture {}", path.display());
        Ok(())
    }
}
