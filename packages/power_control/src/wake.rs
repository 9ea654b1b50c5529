//! Wake-on-LAN magic packets.
//!
//! A magic packet is 6 bytes of `0xFF` followed by the target hardware
//! address repeated 16 times, sent as a single UDP broadcast datagram.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tokio::net::UdpSocket;
use tracing::info;

use crate::ControlError;

pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

/// A 48-bit hardware (MAC) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for HardwareAddress {
    type Err = ControlError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF`, `AABB.CCDD.EEFF`
    /// and bare `AABBCCDDEEFF`, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ControlError::InvalidHardwareAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let hex: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();
        if hex.len() != 12 {
            return Err(invalid("expected 12 hexadecimal digits"));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("non-hexadecimal digit"));
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| invalid("non-hexadecimal digit"))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

/// The wake payload for one hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicPacket([u8; MAGIC_PACKET_LEN]);

impl MagicPacket {
    pub fn new(target: &HardwareAddress) -> Self {
        let mut payload = [0xFFu8; MAGIC_PACKET_LEN];
        for chunk in payload[6..].chunks_exact_mut(6) {
            chunk.copy_from_slice(&target.0);
        }
        Self(payload)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// What was sent. Success means the datagram left this host, not that the
/// target woke up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WakeOutcome {
    pub hardware_address: String,
    pub destination: String,
    pub bytes_sent: usize,
}

#[async_trait]
pub trait WakeSignaler: Send + Sync {
    async fn wake(
        &self,
        target: &HardwareAddress,
        broadcast_address: &str,
        port: u16,
    ) -> Result<WakeOutcome, ControlError>;
}

/// Sends magic packets from an ephemeral UDP socket with `SO_BROADCAST` set.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpWakeSignaler;

#[async_trait]
impl WakeSignaler for UdpWakeSignaler {
    async fn wake(
        &self,
        target: &HardwareAddress,
        broadcast_address: &str,
        port: u16,
    ) -> Result<WakeOutcome, ControlError> {
        let destination = format!("{}:{}", broadcast_address, port);
        let transmission = |source: std::io::Error| ControlError::Transmission {
            target: destination.clone(),
            source,
        };

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(transmission)?;
        socket.set_broadcast(true).map_err(transmission)?;

        let packet = MagicPacket::new(target);
        let bytes_sent = socket
            .send_to(packet.as_bytes(), (broadcast_address, port))
            .await
            .map_err(transmission)?;

        info!("Magic packet for {} sent to {}", target, destination);

        Ok(WakeOutcome {
            hardware_address: target.to_string(),
            destination,
            bytes_sent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_separated() {
        let mac: HardwareAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.octets(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn parses_other_notations() {
        let expected = HardwareAddress::new([0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E]);
        assert_eq!("00-1A-2B-3C-4D-5E".parse::<HardwareAddress>().unwrap(), expected);
        assert_eq!("001A.2B3C.4D5E".parse::<HardwareAddress>().unwrap(), expected);
        assert_eq!("001a2b3c4d5e".parse::<HardwareAddress>().unwrap(), expected);
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!("".parse::<HardwareAddress>().is_err());
        assert!("AA:BB:CC:DD:EE".parse::<HardwareAddress>().is_err());
        assert!("GG:BB:CC:DD:EE:FF".parse::<HardwareAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:FF:00".parse::<HardwareAddress>().is_err());
    }

    #[test]
    fn magic_packet_layout() {
        let mac = HardwareAddress::new([1, 2, 3, 4, 5, 6]);
        let packet = MagicPacket::new(&mac);
        let bytes = packet.as_bytes();

        assert_eq!(bytes.len(), 102);
        assert_eq!(&bytes[..6], &[0xFF; 6]);
        for chunk in bytes[6..].chunks(6) {
            assert_eq!(chunk, &[1, 2, 3, 4, 5, 6]);
        }
    }

    #[tokio::test]
    async fn sends_packet_to_listener() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let mac = HardwareAddress::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);

        let outcome = UdpWakeSignaler.wake(&mac, "127.0.0.1", port).await.unwrap();
        assert_eq!(outcome.bytes_sent, MAGIC_PACKET_LEN);
        assert_eq!(outcome.destination, format!("127.0.0.1:{}", port));

        let mut buf = [0u8; 256];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], MagicPacket::new(&mac).as_bytes());
    }

    #[tokio::test]
    async fn invalid_destination_is_transmission_error() {
        let mac = HardwareAddress::new([0; 6]);
        let err = UdpWakeSignaler
            .wake(&mac, "not a host name", 9)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Transmission { .. }));
    }
}
