/*!
Capture UDP loopback pour vérifier les magic packets sans réseau réel.

Le gateway est configuré pour envoyer vers `127.0.0.1:<port de la capture>`
au lieu du broadcast ; la capture enregistre chaque datagramme reçu.
*/

use anyhow::{bail, Result};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub struct PacketCapture {
    socket: UdpSocket,
    port: u16,
}

impl PacketCapture {
    pub async fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let port = socket.local_addr()?.port();
        log::info!("UDP capture listening on 127.0.0.1:{}", port);
        Ok(Self { socket, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Prochain datagramme, ou `None` après `timeout_ms`.
    pub async fn next_packet(&self, timeout_ms: u64) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 1024];
        match timeout(Duration::from_millis(timeout_ms), self.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                log::info!("captured {} bytes from {}", n, from);
                Ok(Some(buf[..n].to_vec()))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    /// Exactement `count` datagrammes, erreur si l'un manque.
    pub async fn expect_packets(&self, count: usize, timeout_ms: u64) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::with_capacity(count);
        while packets.len() < count {
            match self.next_packet(timeout_ms).await? {
                Some(p) => packets.push(p),
                None => bail!("expected {} packets, got {}", count, packets.len()),
            }
        }
        Ok(packets)
    }
}

/// Magic packet attendu, calculé indépendamment du gateway.
pub fn expected_magic_packet(mac: &str) -> Result<Vec<u8>> {
    let octets: Vec<u8> = mac
        .split([':', '-'])
        .map(|pair| u8::from_str_radix(pair, 16))
        .collect::<Result<_, _>>()?;
    if octets.len() != 6 {
        bail!("MAC must have 6 octets: {}", mac);
    }
    let mut packet = vec![0xFF; 6];
    for _ in 0..16 {
        packet.extend_from_slice(&octets);
    }
    Ok(packet)
}
