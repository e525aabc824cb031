//! Sync client (timing follower)
//!
//! Receives ClockSync and control commands from a leader, disciplines the
//! local master clock, measures round-trip latency with periodic pings, and
//! reconnects with exponential backoff after the server goes silent.

use crate::protocol::{Command, CommandKind, PACKET_LEN};
use crate::error::Result;
use ensemble_common::params::{PING_INTERVAL, STALE_PEER_TIMEOUT};
use ensemble_common::time::{now_ticks, ticks_to_seconds};
use ensemble_common::{ConnectionState, MasterClock};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Rolling latency window length.
const LATENCY_WINDOW: usize = 100;

/// Receive poll granularity; staleness is checked between polls.
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Reconnect backoff: base 1 s, doubling, capped at 32 s, 10 attempts.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(32);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    pub server_addr: SocketAddr,

    /// Permit local transport control while Disconnected
    pub allow_offline_playback: bool,

    /// Server silence tolerated before the connection is declared lost
    pub stale_timeout: Duration,

    pub ping_interval: Duration,
}

impl SyncClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            allow_offline_playback: false,
            stale_timeout: STALE_PEER_TIMEOUT,
            ping_interval: PING_INTERVAL,
        }
    }
}

/// Commands the client raises for the transport controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Play,
    Pause,
    Stop,
    Seek(f64),
    Tempo { value: f32, smooth: bool },
    ConnectionChanged(ConnectionState),
}

struct ClientInner {
    config: SyncClientConfig,
    socket: UdpSocket,
    clock: Arc<MasterClock>,
    state: AtomicU8,
    events: mpsc::Sender<ClientEvent>,
    latency: Mutex<VecDeque<f64>>,
    last_server_msg: Mutex<Instant>,
    sequence: AtomicI32,
}

impl ClientInner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        let old = self.state.swap(state as u8, Ordering::AcqRel);
        if old != state as u8 {
            info!("sync connection: {:?}", state);
            let _ = self.events.try_send(ClientEvent::ConnectionChanged(state));
        }
    }

    async fn send_command(&self, command: &Command) {
        let mut buf = [0u8; PACKET_LEN];
        if command.serialize(&mut buf).is_ok() {
            if let Err(e) = self.socket.send(&buf).await {
                debug!("send failed: {}", e);
            }
        }
    }

    async fn send_handshake(&self) {
        let mut handshake = Command::new(CommandKind::ClientHandshake);
        handshake.ntp_timestamp = now_ticks();
        handshake.sequence_number = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.send_command(&handshake).await;
    }

    fn record_latency(&self, rtt_seconds: f64) {
        let mut window = self.latency.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(rtt_seconds);
    }

    fn handle_packet(&self, command: &Command) {
        *self.last_server_msg.lock() = Instant::now();

        match command.kind {
            CommandKind::ClockSync => {
                // First sync completes the connection; every sync
                // disciplines the clock before the next fill.
                if self.state() != ConnectionState::Synced {
                    self.set_state(ConnectionState::Synced);
                }
                self.clock.seek(command.master_clock_timestamp);
            }
            CommandKind::Play => {
                let _ = self.events.try_send(ClientEvent::Play);
            }
            CommandKind::Pause => {
                let _ = self.events.try_send(ClientEvent::Pause);
            }
            CommandKind::Stop => {
                let _ = self.events.try_send(ClientEvent::Stop);
            }
            CommandKind::Seek => {
                let _ = self
                    .events
                    .try_send(ClientEvent::Seek(command.target_position));
            }
            CommandKind::Tempo => {
                let _ = self.events.try_send(ClientEvent::Tempo {
                    value: command.tempo_value,
                    smooth: command.use_smooth,
                });
            }
            CommandKind::Pong => {
                let rtt = ticks_to_seconds(now_ticks() - command.client_send_time);
                if rtt >= 0.0 {
                    self.record_latency(rtt);
                }
            }
            CommandKind::ServerHandshake | CommandKind::ServerAnnouncement => {
                if self.state() == ConnectionState::Connecting
                    || self.state() == ConnectionState::Disconnected
                {
                    self.set_state(ConnectionState::Connected);
                }
            }
            CommandKind::Ping | CommandKind::ClientHandshake => {
                // client-bound kinds only; ignore
            }
        }
    }
}

/// UDP timing follower.
pub struct SyncClient {
    inner: Arc<ClientInner>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SyncClient {
    /// Connect to a leader and start the receive and ping loops. Command
    /// events arrive on the returned receiver.
    pub async fn start(
        config: SyncClientConfig,
        clock: Arc<MasterClock>,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(config.server_addr).await?;
        info!("sync client targeting {}", config.server_addr);

        let (events_tx, events_rx) = mpsc::channel(64);
        let inner = Arc::new(ClientInner {
            config,
            socket,
            clock,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            events: events_tx,
            latency: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            last_server_msg: Mutex::new(Instant::now()),
            sequence: AtomicI32::new(0),
        });

        inner.send_handshake().await;

        let receive_task = tokio::spawn(Self::receive_loop(Arc::clone(&inner)));
        let ping_task = tokio::spawn(Self::ping_loop(Arc::clone(&inner)));

        Ok((
            Self {
                inner,
                tasks: vec![receive_task, ping_task],
            },
            events_rx,
        ))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether the transport may act on local control input right now.
    pub fn local_control_allowed(&self) -> bool {
        match self.inner.state() {
            ConnectionState::Synced => true,
            ConnectionState::Disconnected => self.inner.config.allow_offline_playback,
            _ => false,
        }
    }

    /// Rolling average round-trip latency in seconds (0.0 before the first
    /// pong).
    pub fn average_latency_seconds(&self) -> f64 {
        let window = self.inner.latency.lock();
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<f64>() / window.len() as f64
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Receive with a short timeout; detect staleness and drive the
    /// reconnect backoff between polls. The receive buffer is reused for
    /// every packet.
    async fn receive_loop(inner: Arc<ClientInner>) {
        let mut buf = [0u8; PACKET_LEN];
        let mut reconnect_attempts: u32 = 0;
        let mut next_reconnect: Option<Instant> = None;

        loop {
            match tokio::time::timeout(RECV_TIMEOUT, inner.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    // Invalid packets are dropped silently
                    if let Some(command) = Command::deserialize(&buf[..len]) {
                        inner.handle_packet(&command);
                        reconnect_attempts = 0;
                        next_reconnect = None;
                    }
                }
                Ok(Err(e)) => {
                    debug!("receive error: {}", e);
                }
                Err(_) => {
                    // poll timeout; fall through to staleness check
                }
            }

            // Staleness: declare the connection lost once and schedule the
            // first reconnect attempt. While a backoff cycle is running
            // (`next_reconnect` set), the intermediate Connecting state must
            // not restart it.
            let silent_for = inner.last_server_msg.lock().elapsed();
            if silent_for > inner.config.stale_timeout
                && inner.state() != ConnectionState::Disconnected
                && next_reconnect.is_none()
            {
                warn!("server silent for {:.0?}; connection lost", silent_for);
                inner.set_state(ConnectionState::Disconnected);
                reconnect_attempts = 0;
                next_reconnect = Some(Instant::now() + RECONNECT_BASE);
            }

            if let Some(when) = next_reconnect {
                if Instant::now() >= when {
                    if reconnect_attempts < RECONNECT_MAX_ATTEMPTS {
                        reconnect_attempts += 1;
                        let backoff = RECONNECT_BASE
                            .checked_mul(1 << reconnect_attempts.min(5))
                            .unwrap_or(RECONNECT_CAP)
                            .min(RECONNECT_CAP);
                        debug!(
                            "reconnect attempt {} (next in {:?})",
                            reconnect_attempts, backoff
                        );
                        inner.set_state(ConnectionState::Connecting);
                        inner.send_handshake().await;
                        next_reconnect = Some(Instant::now() + backoff);
                    } else {
                        warn!("reconnect attempts exhausted");
                        inner.set_state(ConnectionState::Disconnected);
                        next_reconnect = None;
                    }
                }
            }
        }
    }

    async fn ping_loop(inner: Arc<ClientInner>) {
        let mut ticker = tokio::time::interval(inner.config.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if inner.state() == ConnectionState::Disconnected {
                continue;
            }
            let ping = Command::ping(
                now_ticks(),
                inner.sequence.fetch_add(1, Ordering::Relaxed),
            );
            inner.send_command(&ping).await;
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_common::ClockMode;

    /// Minimal loopback leader for client tests.
    async fn fake_server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn first_clock_sync_transitions_to_synced_and_seeks_clock() {
        let (server, addr) = fake_server().await;
        let clock = Arc::new(MasterClock::new(48_000, ClockMode::NetworkClient));
        let config = SyncClientConfig::new(addr);
        let (client, mut events) = SyncClient::start(config, Arc::clone(&clock)).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);

        // Await the handshake so we know the client's address
        let mut buf = [0u8; PACKET_LEN];
        let (_, client_addr) = server.recv_from(&mut buf).await.unwrap();

        let sync = Command::clock_sync(now_ticks(), 3.21, 154_080, 48_000);
        let mut out = [0u8; PACKET_LEN];
        sync.serialize(&mut out).unwrap();
        server.send_to(&out, client_addr).await.unwrap();

        // Connection change surfaces as an event
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("no event")
                .unwrap();
            if event == ClientEvent::ConnectionChanged(ConnectionState::Synced) {
                break;
            }
        }
        assert_eq!(client.state(), ConnectionState::Synced);
        assert!((clock.current_timestamp() - 3.21).abs() < 0.01);
    }

    #[tokio::test]
    async fn transport_commands_surface_as_events() {
        let (server, addr) = fake_server().await;
        let clock = Arc::new(MasterClock::new(44_100, ClockMode::NetworkClient));
        let (_client, mut events) = SyncClient::start(SyncClientConfig::new(addr), clock)
            .await
            .unwrap();

        let mut buf = [0u8; PACKET_LEN];
        let (_, client_addr) = server.recv_from(&mut buf).await.unwrap();

        let mut out = [0u8; PACKET_LEN];
        Command::seek(7.5, now_ticks()).serialize(&mut out).unwrap();
        server.send_to(&out, client_addr).await.unwrap();
        Command::tempo(0.9, true, now_ticks())
            .serialize(&mut out)
            .unwrap();
        server.send_to(&out, client_addr).await.unwrap();

        let mut saw_seek = false;
        let mut saw_tempo = false;
        while !(saw_seek && saw_tempo) {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("missing command event")
                .unwrap();
            match event {
                ClientEvent::Seek(target) => {
                    assert_eq!(target, 7.5);
                    saw_seek = true;
                }
                ClientEvent::Tempo { value, smooth } => {
                    assert_eq!(value, 0.9);
                    assert!(smooth);
                    saw_tempo = true;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn pong_updates_rolling_latency() {
        let (server, addr) = fake_server().await;
        let clock = Arc::new(MasterClock::new(44_100, ClockMode::NetworkClient));
        let mut config = SyncClientConfig::new(addr);
        config.ping_interval = Duration::from_millis(50);
        let (client, _events) = SyncClient::start(config, clock).await.unwrap();
        assert_eq!(client.average_latency_seconds(), 0.0);

        // Answer every ping with a pong echoing the send time
        let mut buf = [0u8; PACKET_LEN];
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            let Ok(Ok((len, from))) = tokio::time::timeout(
                Duration::from_millis(200),
                server.recv_from(&mut buf),
            )
            .await
            else {
                continue;
            };
            if let Some(command) = Command::deserialize(&buf[..len]) {
                if command.kind == CommandKind::Ping {
                    let pong =
                        Command::pong(now_ticks(), command.client_send_time, command.sequence_number);
                    let mut out = [0u8; PACKET_LEN];
                    pong.serialize(&mut out).unwrap();
                    server.send_to(&out, from).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if client.average_latency_seconds() > 0.0 {
                        break;
                    }
                }
            }
        }

        assert!(client.average_latency_seconds() > 0.0);
        assert!(client.average_latency_seconds() < 0.5);
    }

    #[tokio::test]
    async fn goes_disconnected_after_staleness_and_gates_local_control() {
        let (_server, addr) = fake_server().await;
        let clock = Arc::new(MasterClock::new(44_100, ClockMode::NetworkClient));
        let mut config = SyncClientConfig::new(addr);
        config.stale_timeout = Duration::from_millis(100);
        config.allow_offline_playback = true;
        let (client, mut events) = SyncClient::start(config, clock).await.unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
                .await
                .expect("never disconnected")
                .unwrap();
            if event == ClientEvent::ConnectionChanged(ConnectionState::Disconnected) {
                break;
            }
        }
        // offline playback permitted by config
        assert!(client.local_control_allowed());
    }
}
