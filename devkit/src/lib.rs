/*!
# WOL Gateway DevKit - Fixtures et capture UDP pour les tests

Bibliothèque facilitant les tests du gateway avec:
- Fichiers serveurs / admin générés dans un répertoire temporaire
- Capture UDP en loopback pour vérifier les magic packets émis
*/

pub mod fixtures;
pub mod test_utils;
pub mod udp_capture;

pub use fixtures::{admin_record, servers_document, ServerFixture};
pub use test_utils::TestHarness;
pub use udp_capture::{expected_magic_packet, PacketCapture};
