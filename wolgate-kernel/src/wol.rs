/**
 * WAKE DISPATCHER - Envoi du magic packet Wake-on-LAN
 *
 * FORMAT : 6 x 0xFF puis 16 fois l'adresse MAC (102 octets).
 * TRANSPORT : un datagramme UDP en broadcast, port 9 par défaut.
 *
 * "envoyé" ne veut pas dire "réveillé" : aucun accusé de réception n'existe.
 * Les répétitions éventuelles sont décidées par l'appelant.
 */

use crate::models::{MacAddress, MacParseError, ServerEntry};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub const MAGIC_PACKET_LEN: usize = 102;
pub const DEFAULT_PORT: u16 = 9;

#[derive(Debug, thiserror::Error)]
pub enum WakeError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
    #[error("failed to send magic packet: {0}")]
    SendFailure(#[source] io::Error),
}

/// Construit le magic packet ; aucune E/S si la MAC est invalide.
pub fn build_packet(mac: &str) -> Result<[u8; MAGIC_PACKET_LEN], WakeError> {
    let mac: MacAddress = mac
        .parse()
        .map_err(|e: MacParseError| WakeError::InvalidMac(e.0))?;
    Ok(magic_packet(mac.octets()))
}

fn magic_packet(mac: [u8; 6]) -> [u8; MAGIC_PACKET_LEN] {
    let mut pkt = [0xFFu8; MAGIC_PACKET_LEN];
    for chunk in pkt[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    pkt
}

/// Socket UDP partagée, broadcast activé. `send_to` prend `&self`,
/// la même instance sert toutes les requêtes.
pub struct WakeDispatcher {
    socket: UdpSocket,
}

impl WakeDispatcher {
    pub async fn bind() -> io::Result<Self> {
        Self::bind_to(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await
    }

    pub async fn bind_to(addr: SocketAddrV4) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self { socket })
    }

    /// Un seul datagramme, pas de nouvel essai.
    pub async fn send(
        &self,
        packet: &[u8; MAGIC_PACKET_LEN],
        broadcast: Ipv4Addr,
        port: u16,
    ) -> Result<(), WakeError> {
        let target = SocketAddrV4::new(broadcast, port);
        match self.socket.send_to(packet, target).await {
            Ok(_) => {
                debug!("magic packet sent to {}", target);
                Ok(())
            }
            Err(e) => {
                warn!("WOL send error to {} -> {}", target, e);
                Err(WakeError::SendFailure(e))
            }
        }
    }

    pub async fn wake(&self, entry: &ServerEntry, port: u16) -> Result<(), WakeError> {
        let packet = build_packet(&entry.mac)?;
        let broadcast = entry.broadcast().map_err(|e| {
            WakeError::SendFailure(io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;
        self.send(&packet, broadcast, port).await
    }
}
