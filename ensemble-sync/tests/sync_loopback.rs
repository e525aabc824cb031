//! Leader/follower loopback: a real server and a real client on localhost.

use ensemble_common::{ClockMode, ConnectionState, MasterClock};
use ensemble_sync::{
    ClientEvent, Command, NetworkTimeProvider, SyncClient, SyncClientConfig, SyncServer,
    SyncServerConfig,
};
use std::sync::Arc;
use std::time::Duration;

async fn leader_and_follower() -> (SyncServer, Arc<MasterClock>, SyncClient, Arc<MasterClock>,
    tokio::sync::mpsc::Receiver<ClientEvent>) {
    let server_clock = Arc::new(MasterClock::new(48_000, ClockMode::NetworkServer));
    let server = SyncServer::start(
        SyncServerConfig { port: 0 },
        Arc::clone(&server_clock),
        NetworkTimeProvider::new(),
    )
    .await
    .unwrap();
    let port = server.local_addr().unwrap().port();

    let client_clock = Arc::new(MasterClock::new(48_000, ClockMode::NetworkClient));
    let (client, events) = SyncClient::start(
        SyncClientConfig::new(([127, 0, 0, 1], port).into()),
        Arc::clone(&client_clock),
    )
    .await
    .unwrap();

    (server, server_clock, client, client_clock, events)
}

/// The follower reaches Synced and its clock lands on the leader's
/// broadcast timestamp within one broadcast period.
#[tokio::test(flavor = "multi_thread")]
async fn follower_clock_is_disciplined_to_leader() {
    let (_server, server_clock, client, client_clock, mut events) = leader_and_follower().await;
    server_clock.seek(3.210);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.state() != ConnectionState::Synced {
        assert!(tokio::time::Instant::now() < deadline, "never synced");
        let _ = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
    }

    // Give one more broadcast tick to land after the seek
    tokio::time::sleep(Duration::from_millis(50)).await;
    let delta = (client_clock.current_timestamp() - server_clock.current_timestamp()).abs();
    assert!(delta < 0.05, "clocks differ by {:.3}s", delta);
}

/// Control commands queued on the leader surface as client events on the
/// follower.
#[tokio::test(flavor = "multi_thread")]
async fn leader_commands_reach_follower() {
    let (server, _server_clock, _client, _client_clock, mut events) = leader_and_follower().await;

    // Wait for the handshake to register the peer so the relay has a
    // destination.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.peer_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "peer never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(server.enqueue_command(Command::seek(12.5, 0)));
    assert!(server.enqueue_command(Command::tempo(0.95, true, 0)));

    let mut saw_seek = false;
    let mut saw_tempo = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !(saw_seek && saw_tempo) {
        assert!(tokio::time::Instant::now() < deadline, "commands never arrived");
        let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(500), events.recv()).await
        else {
            continue;
        };
        match event {
            ClientEvent::Seek(target) => {
                assert_eq!(target, 12.5);
                saw_seek = true;
            }
            ClientEvent::Tempo { value, smooth } => {
                assert_eq!(value, 0.95);
                assert!(smooth);
                saw_tempo = true;
            }
            _ => {}
        }
    }
}
