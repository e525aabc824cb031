//! Tiered network time provider
//!
//! Supplies the offset between the local system clock and a shared
//! reference. Tiers are tried in order until one succeeds:
//!
//! 1. **LAN NTP** — standard NTP query against well-known gateway addresses
//!    (port 123), deadline ≤ 1 s across the tier
//! 2. **Peer** — Cristian's algorithm over the sync protocol's Ping/Pong:
//!    `offset = server_time + rtt/2 − local_receive_time`, deadline ≤ 1 s
//! 3. **Local** — system time, offset zero
//!
//! Periodic re-sync is the caller's responsibility.

use crate::protocol::{Command, CommandKind, PACKET_LEN};
use ensemble_common::time::{now_ticks, seconds_to_ticks, ticks_to_seconds};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Where the current offset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTier {
    LanNtp,
    Peer,
    Local,
}

/// Gateway addresses worth probing for a LAN NTP responder.
const NTP_GATEWAYS: [&str; 4] = [
    "192.168.0.1:123",
    "192.168.1.1:123",
    "192.168.1.254:123",
    "10.0.0.1:123",
];

/// Per-gateway probe budget; the whole NTP tier stays under one second.
const NTP_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Peer tier deadline.
const PEER_TIMEOUT: Duration = Duration::from_secs(1);

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_DELTA: f64 = 2_208_988_800.0;

/// Offset of the transmit timestamp inside an NTP response.
const NTP_TRANSMIT_OFFSET: usize = 40;

/// Tiered offset to a reference clock.
#[derive(Debug)]
pub struct NetworkTimeProvider {
    offset_seconds: f64,
    last_sync: Option<chrono::DateTime<chrono::Utc>>,
    tier: SyncTier,
}

impl NetworkTimeProvider {
    /// Starts on the local tier with zero offset.
    pub fn new() -> Self {
        Self {
            offset_seconds: 0.0,
            last_sync: None,
            tier: SyncTier::Local,
        }
    }

    pub fn offset_seconds(&self) -> f64 {
        self.offset_seconds
    }

    pub fn tier(&self) -> SyncTier {
        self.tier
    }

    pub fn last_sync(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.last_sync
    }

    /// Reference time in ticks (local ticks plus the learned offset).
    pub fn now_reference_ticks(&self) -> i64 {
        now_ticks() + seconds_to_ticks(self.offset_seconds)
    }

    /// Re-sync, trying each tier in order. Returns the tier that won.
    pub async fn sync(&mut self, peer: Option<SocketAddr>) -> SyncTier {
        if let Some(offset) = Self::query_lan_ntp().await {
            self.apply(offset, SyncTier::LanNtp);
            return self.tier;
        }

        if let Some(peer) = peer {
            if let Some(offset) = Self::query_peer(peer).await {
                self.apply(offset, SyncTier::Peer);
                return self.tier;
            }
        }

        self.apply(0.0, SyncTier::Local);
        self.tier
    }

    fn apply(&mut self, offset: f64, tier: SyncTier) {
        debug!("time sync: tier {:?}, offset {:+.6}s", tier, offset);
        self.offset_seconds = offset;
        self.tier = tier;
        self.last_sync = Some(chrono::Utc::now());
    }

    async fn query_lan_ntp() -> Option<f64> {
        for gateway in NTP_GATEWAYS {
            match timeout(NTP_PROBE_TIMEOUT, Self::ntp_query(gateway)).await {
                Ok(Some(offset)) => return Some(offset),
                Ok(None) => trace!("NTP probe to {} failed", gateway),
                Err(_) => trace!("NTP probe to {} timed out", gateway),
            }
        }
        None
    }

    /// One standard NTP client exchange.
    async fn ntp_query(addr: &str) -> Option<f64> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(addr).await.ok()?;

        // LI = 0, VN = 3, Mode = 3 (client)
        let mut request = [0u8; 48];
        request[0] = 0x1B;

        let t_send = unix_now_seconds();
        socket.send(&request).await.ok()?;

        let mut response = [0u8; 48];
        let len = socket.recv(&mut response).await.ok()?;
        let t_recv = unix_now_seconds();
        if len < 48 {
            return None;
        }

        parse_ntp_offset(&response, t_send, t_recv)
    }

    /// Cristian's algorithm over Ping/Pong.
    async fn query_peer(peer: SocketAddr) -> Option<f64> {
        match timeout(PEER_TIMEOUT, Self::peer_exchange(peer)).await {
            Ok(result) => result,
            Err(_) => None,
        }
    }

    async fn peer_exchange(peer: SocketAddr) -> Option<f64> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(peer).await.ok()?;

        let send_ticks = now_ticks();
        let ping = Command::ping(send_ticks, 0);
        let mut buf = [0u8; PACKET_LEN];
        ping.serialize(&mut buf).ok()?;
        socket.send(&buf).await.ok()?;

        let mut response = [0u8; PACKET_LEN];
        loop {
            let len = socket.recv(&mut response).await.ok()?;
            let Some(pong) = Command::deserialize(&response[..len]) else {
                continue;
            };
            if pong.kind != CommandKind::Pong || pong.client_send_time != send_ticks {
                continue;
            }

            let recv_ticks = now_ticks();
            let rtt = ticks_to_seconds(recv_ticks - send_ticks);
            let server_time = ticks_to_seconds(pong.ntp_timestamp);
            let local_receive = ticks_to_seconds(recv_ticks);
            return Some(server_time + rtt / 2.0 - local_receive);
        }
    }
}

impl Default for NetworkTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now_seconds() -> f64 {
    ticks_to_seconds(now_ticks())
}

/// Extract the transmit timestamp from an NTP response and compute the
/// offset against the midpoint of the local send/receive pair.
fn parse_ntp_offset(response: &[u8; 48], t_send: f64, t_recv: f64) -> Option<f64> {
    let seconds = u32::from_be_bytes(
        response[NTP_TRANSMIT_OFFSET..NTP_TRANSMIT_OFFSET + 4]
            .try_into()
            .ok()?,
    );
    let fraction = u32::from_be_bytes(
        response[NTP_TRANSMIT_OFFSET + 4..NTP_TRANSMIT_OFFSET + 8]
            .try_into()
            .ok()?,
    );
    if seconds == 0 {
        return None;
    }

    let server_unix = seconds as f64 - NTP_UNIX_DELTA + fraction as f64 / (1u64 << 32) as f64;
    let local_midpoint = (t_send + t_recv) / 2.0;
    Some(server_unix - local_midpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ntp_response(server_unix: f64) -> [u8; 48] {
        let mut response = [0u8; 48];
        let ntp_seconds = server_unix + NTP_UNIX_DELTA;
        let seconds = ntp_seconds as u64 as u32;
        let fraction = ((ntp_seconds.fract()) * (1u64 << 32) as f64) as u32;
        response[NTP_TRANSMIT_OFFSET..NTP_TRANSMIT_OFFSET + 4]
            .copy_from_slice(&seconds.to_be_bytes());
        response[NTP_TRANSMIT_OFFSET + 4..NTP_TRANSMIT_OFFSET + 8]
            .copy_from_slice(&fraction.to_be_bytes());
        response
    }

    #[test]
    fn parses_ntp_offset() {
        // Server 2.0 s ahead of the local midpoint
        let response = ntp_response(1_000_002.0);
        let offset = parse_ntp_offset(&response, 999_999.9, 1_000_000.1).unwrap();
        assert!((offset - 2.0).abs() < 1e-3);
    }

    #[test]
    fn rejects_zero_transmit_timestamp() {
        let response = [0u8; 48];
        assert!(parse_ntp_offset(&response, 0.0, 0.1).is_none());
    }

    #[test]
    fn reference_ticks_include_offset() {
        let mut provider = NetworkTimeProvider::new();
        provider.offset_seconds = 1.5;
        let reference = provider.now_reference_ticks();
        let local = now_ticks();
        let delta = ticks_to_seconds(reference - local);
        assert!((delta - 1.5).abs() < 0.1);
    }

    #[tokio::test]
    async fn peer_tier_answers_through_loopback() {
        // Loopback "server" that answers pings with pongs
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; PACKET_LEN];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let ping = Command::deserialize(&buf[..len]).unwrap();
            let pong = Command::pong(now_ticks(), ping.client_send_time, ping.sequence_number);
            let mut out = [0u8; PACKET_LEN];
            pong.serialize(&mut out).unwrap();
            server.send_to(&out, from).await.unwrap();
        });

        let offset = NetworkTimeProvider::query_peer(server_addr).await.unwrap();
        // Same host: offset is sub-second
        assert!(offset.abs() < 0.5);
    }
}
