//! Sync server (timing leader)
//!
//! Broadcasts the master clock at 100 Hz over UDP, relays control commands
//! from a bounded lock-free queue, answers pings for RTT measurement, and
//! evicts peers that have gone silent.

use crate::protocol::{Command, CommandKind, DEFAULT_PORT, PACKET_LEN};
use crate::time_provider::NetworkTimeProvider;
use crate::error::Result;
use crossbeam_queue::ArrayQueue;
use ensemble_common::params::{BROADCAST_INTERVAL, STALE_PEER_TIMEOUT};
use ensemble_common::MasterClock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

/// Command relay ring depth.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Peer evictions are checked roughly once a second.
const EVICTION_EVERY_TICKS: u64 = 100;

#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    pub port: u16,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

struct ServerShared {
    socket: UdpSocket,
    clock: Arc<MasterClock>,
    provider: Mutex<NetworkTimeProvider>,
    peers: Mutex<HashMap<SocketAddr, Instant>>,
    queue: ArrayQueue<Command>,
    sequence: AtomicI32,
    broadcast_addr: SocketAddr,
}

impl ServerShared {
    fn next_sequence(&self) -> i32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn reference_ticks(&self) -> i64 {
        self.provider.lock().now_reference_ticks()
    }

    /// Send to the broadcast address and, for reliability on networks that
    /// filter broadcast, to every registered peer.
    async fn send_everywhere(&self, buf: &[u8]) {
        if let Err(e) = self.socket.send_to(buf, self.broadcast_addr).await {
            trace!("broadcast send failed: {}", e);
        }
        let peers: Vec<SocketAddr> = self.peers.lock().keys().copied().collect();
        for peer in peers {
            if let Err(e) = self.socket.send_to(buf, peer).await {
                trace!("send to {} failed: {}", peer, e);
            }
        }
    }
}

/// UDP timing leader.
pub struct SyncServer {
    shared: Arc<ServerShared>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SyncServer {
    /// Bind the socket and start the broadcast and receive loops.
    pub async fn start(
        config: SyncServerConfig,
        clock: Arc<MasterClock>,
        provider: NetworkTimeProvider,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.port)).await?;
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;
        info!("sync server listening on {}", local);

        let broadcast_addr: SocketAddr = ([255, 255, 255, 255], local.port()).into();

        let shared = Arc::new(ServerShared {
            socket,
            clock,
            provider: Mutex::new(provider),
            peers: Mutex::new(HashMap::new()),
            queue: ArrayQueue::new(COMMAND_QUEUE_DEPTH),
            sequence: AtomicI32::new(0),
            broadcast_addr,
        });

        let broadcast_task = tokio::spawn(Self::broadcast_loop(Arc::clone(&shared)));
        let receive_task = tokio::spawn(Self::receive_loop(Arc::clone(&shared)));

        Ok(Self {
            shared,
            tasks: vec![broadcast_task, receive_task],
        })
    }

    /// The local port the server bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Queue a control command for the next broadcast tick.
    ///
    /// Lock-free push into a fixed 256-slot ring; returns false when the
    /// ring is full (the caller decides whether to retry).
    pub fn enqueue_command(&self, command: Command) -> bool {
        self.shared.queue.push(command).is_ok()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// Stop the broadcast and receive loops.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// 100 Hz: clock sync, queued command relay, periodic peer eviction.
    async fn broadcast_loop(shared: Arc<ServerShared>) {
        let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut buf = [0u8; PACKET_LEN];
        let mut tick: u64 = 0;

        loop {
            ticker.tick().await;
            tick += 1;

            let mut sync = Command::clock_sync(
                shared.reference_ticks(),
                shared.clock.current_timestamp(),
                shared.clock.current_sample_position() as i64,
                shared.clock.sample_rate() as i32,
            );
            sync.sequence_number = shared.next_sequence();
            if sync.serialize(&mut buf).is_ok() {
                shared.send_everywhere(&buf).await;
            }

            while let Some(mut command) = shared.queue.pop() {
                command.sequence_number = shared.next_sequence();
                if command.ntp_timestamp == 0 {
                    command.ntp_timestamp = shared.reference_ticks();
                }
                if command.serialize(&mut buf).is_ok() {
                    shared.send_everywhere(&buf).await;
                }
            }

            if tick % EVICTION_EVERY_TICKS == 0 {
                // Announce presence for discovery at the same ~1 s cadence
                let mut announcement = Command::new(CommandKind::ServerAnnouncement);
                announcement.ntp_timestamp = shared.reference_ticks();
                announcement.sample_rate = shared.clock.sample_rate() as i32;
                announcement.sequence_number = shared.next_sequence();
                if announcement.serialize(&mut buf).is_ok() {
                    shared.send_everywhere(&buf).await;
                }

                let mut peers = shared.peers.lock();
                let before = peers.len();
                peers.retain(|addr, last_seen| {
                    let keep = last_seen.elapsed() < STALE_PEER_TIMEOUT;
                    if !keep {
                        warn!("evicting stale peer {}", addr);
                    }
                    keep
                });
                if peers.len() != before {
                    debug!("{} peer(s) remain", peers.len());
                }
            }
        }
    }

    async fn receive_loop(shared: Arc<ServerShared>) {
        let mut buf = [0u8; PACKET_LEN];
        let mut reply = [0u8; PACKET_LEN];

        loop {
            let (len, from) = match shared.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("receive error: {}", e);
                    continue;
                }
            };

            // Bad magic/version/length: drop silently, never interrupt
            // reception.
            let Some(command) = Command::deserialize(&buf[..len]) else {
                continue;
            };

            shared.peers.lock().insert(from, Instant::now());

            match command.kind {
                CommandKind::Ping => {
                    let pong = Command::pong(
                        shared.reference_ticks(),
                        command.client_send_time,
                        command.sequence_number,
                    );
                    if pong.serialize(&mut reply).is_ok() {
                        let _ = shared.socket.send_to(&reply, from).await;
                    }
                }
                CommandKind::ClientHandshake => {
                    debug!("handshake from {}", from);
                    let mut handshake = Command::new(CommandKind::ServerHandshake);
                    handshake.ntp_timestamp = shared.reference_ticks();
                    handshake.sample_rate = shared.clock.sample_rate() as i32;
                    handshake.sequence_number = shared.next_sequence();
                    if handshake.serialize(&mut reply).is_ok() {
                        let _ = shared.socket.send_to(&reply, from).await;
                    }
                }
                _ => {
                    // Any other valid packet only refreshes the heartbeat
                }
            }
        }
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_common::ClockMode;

    async fn start_test_server() -> (SyncServer, SocketAddr, Arc<MasterClock>) {
        let clock = Arc::new(MasterClock::new(48_000, ClockMode::NetworkServer));
        clock.seek(3.21);
        let server = SyncServer::start(
            SyncServerConfig { port: 0 },
            Arc::clone(&clock),
            NetworkTimeProvider::new(),
        )
        .await
        .unwrap();
        let port = server.local_addr().unwrap().port();
        (server, ([127, 0, 0, 1], port).into(), clock)
    }

    #[tokio::test]
    async fn answers_ping_with_echoed_send_time() {
        let (_server, addr, _clock) = start_test_server().await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();

        let mut buf = [0u8; PACKET_LEN];
        Command::ping(123_456, 7).serialize(&mut buf).unwrap();
        socket.send(&buf).await.unwrap();

        let mut response = [0u8; PACKET_LEN];
        loop {
            let len = socket.recv(&mut response).await.unwrap();
            let command = Command::deserialize(&response[..len]).unwrap();
            if command.kind == CommandKind::Pong {
                assert_eq!(command.client_send_time, 123_456);
                assert_eq!(command.sequence_number, 7);
                assert!(command.ntp_timestamp > 0);
                break;
            }
        }
    }

    #[tokio::test]
    async fn handshake_registers_peer_and_streams_clock_sync() {
        let (server, addr, clock) = start_test_server().await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();

        let mut buf = [0u8; PACKET_LEN];
        Command::new(CommandKind::ClientHandshake)
            .serialize(&mut buf)
            .unwrap();
        socket.send(&buf).await.unwrap();

        let mut saw_handshake = false;
        let mut saw_clock_sync = false;
        let mut response = [0u8; PACKET_LEN];
        for _ in 0..20 {
            let len = tokio::time::timeout(
                std::time::Duration::from_millis(500),
                socket.recv(&mut response),
            )
            .await
            .expect("server went silent")
            .unwrap();
            match Command::deserialize(&response[..len]).map(|c| c.kind) {
                Some(CommandKind::ServerHandshake) => saw_handshake = true,
                Some(CommandKind::ClockSync) => {
                    let command = Command::deserialize(&response[..len]).unwrap();
                    assert!((command.master_clock_timestamp - 3.21).abs() < 0.01);
                    assert_eq!(command.sample_rate, 48_000);
                    assert_eq!(
                        command.master_clock_sample_position,
                        clock.current_sample_position() as i64
                    );
                    saw_clock_sync = true;
                }
                _ => {}
            }
            if saw_handshake && saw_clock_sync {
                break;
            }
        }
        assert!(saw_handshake);
        assert!(saw_clock_sync);
        assert_eq!(server.peer_count(), 1);
    }

    #[tokio::test]
    async fn relays_enqueued_commands() {
        let (server, addr, _clock) = start_test_server().await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();

        // Register so unicast relay reaches us
        let mut buf = [0u8; PACKET_LEN];
        Command::new(CommandKind::ClientHandshake)
            .serialize(&mut buf)
            .unwrap();
        socket.send(&buf).await.unwrap();

        assert!(server.enqueue_command(Command::seek(12.5, 0)));

        let mut response = [0u8; PACKET_LEN];
        loop {
            let len = tokio::time::timeout(
                std::time::Duration::from_secs(2),
                socket.recv(&mut response),
            )
            .await
            .expect("seek was never relayed")
            .unwrap();
            if let Some(command) = Command::deserialize(&response[..len]) {
                if command.kind == CommandKind::Seek {
                    assert_eq!(command.target_position, 12.5);
                    assert!(command.ntp_timestamp > 0); // stamped by server
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn queue_rejects_when_full() {
        // Single-threaded test runtime: the broadcast drain cannot run
        // between these synchronous pushes, so the ring fills
        // deterministically.
        let (server, _addr, _clock) = start_test_server().await;
        let mut accepted = 0;
        for _ in 0..COMMAND_QUEUE_DEPTH + 10 {
            if server.enqueue_command(Command::new(CommandKind::Pause)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, COMMAND_QUEUE_DEPTH);
        assert!(!server.enqueue_command(Command::new(CommandKind::Pause)));
    }
}
