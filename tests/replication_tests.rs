//! Primary-replica synchronisation over real sockets.

mod common;

use common::{spawn_server, wait_until, TestClient, TestReply};
use ember::ServerConfig;
use std::time::Duration;

/// A hand-driven replica connection for exercising the PSYNC handshake
/// byte by byte.
struct HandshakeProbe {
    client: TestClient,
}

impl HandshakeProbe {
    fn connect(addr: std::net::SocketAddr) -> Self {
        HandshakeProbe {
            client: TestClient::connect(addr),
        }
    }

    fn psync(&mut self, run_id: &str, offset: i64) -> String {
        self.client
            .send_command(&["PSYNC", run_id, &offset.to_string()]);
        self.client.read_line()
    }

    /// Read `$<len>\r\n<payload>\r\n`.
    fn read_payload(&mut self) -> Vec<u8> {
        let header = self.client.read_line();
        let len: usize = header
            .strip_prefix('$')
            .and_then(|d| d.parse().ok())
            .unwrap_or_else(|| panic!("expected bulk header, got {:?}", header));
        let payload = self.client.read_exact_bytes(len);
        assert_eq!(self.client.read_exact_bytes(2), b"\r\n");
        payload
    }
}

#[test]
fn test_full_resync_baseline() {
    let (primary, primary_addr) = spawn_server(ServerConfig::for_testing());
    let mut feeder = TestClient::connect(primary_addr);
    for i in 0..1000 {
        feeder.command(&["SET", &format!("key:{:04}", i), &format!("value-{}", i)]);
    }
    let announced = primary.coordinator().master_offset();
    assert!(announced > 0);

    let (replica, replica_addr) = spawn_server(ServerConfig::for_testing());
    let mut admin = TestClient::connect(replica_addr);
    assert_eq!(
        admin.command(&["REPLICAOF", "127.0.0.1", &primary_addr.port().to_string()]),
        TestReply::ok()
    );

    assert!(
        wait_until(Duration::from_secs(10), || {
            replica
                .replica_status()
                .is_some_and(|s| s.replication_offset >= announced)
        }),
        "replica never reached the primary's offset"
    );

    let status = replica.replica_status().unwrap();
    assert_eq!(status.replication_offset, announced);
    assert_eq!(status.master_replication_offset, announced);

    // KEYS * on the replica yields exactly the primary's set.
    let mut primary_client = TestClient::connect(primary_addr);
    let primary_keys = primary_client.command(&["KEYS", "*"]);
    let replica_keys = admin.command(&["KEYS", "*"]);
    assert_eq!(primary_keys, replica_keys);
    match replica_keys {
        TestReply::Array(items) => assert_eq!(items.len(), 1000),
        other => panic!("unexpected reply {:?}", other),
    }
}

#[test]
fn test_streaming_after_full_sync() {
    let (primary, primary_addr) = spawn_server(ServerConfig::for_testing());
    let mut feeder = TestClient::connect(primary_addr);
    feeder.command(&["SET", "seed", "1"]);

    let (replica, replica_addr) = spawn_server(ServerConfig::for_testing());
    let mut admin = TestClient::connect(replica_addr);
    admin.command(&["REPLICAOF", "127.0.0.1", &primary_addr.port().to_string()]);

    assert!(wait_until(Duration::from_secs(10), || {
        replica.replica_status().is_some_and(|s| {
            s.replication_offset >= primary.coordinator().master_offset()
        })
    }));

    // Live writes flow through in commit order.
    feeder.command(&["SET", "live", "yes"]);
    feeder.command(&["RPUSH", "stream", "a", "b"]);
    assert!(wait_until(Duration::from_secs(10), || {
        replica
            .replica_status()
            .is_some_and(|s| s.replication_offset >= primary.coordinator().master_offset())
    }));
    assert_eq!(admin.command(&["GET", "live"]), TestReply::bulk("yes"));
    assert_eq!(
        admin.command(&["LRANGE", "stream", "0", "-1"]),
        TestReply::array_of(&["a", "b"])
    );

    // The primary tracked the replica's acked offset.
    assert!(wait_until(Duration::from_secs(10), || {
        primary
            .coordinator()
            .peers()
            .iter()
            .any(|p| p.acked_offset == primary.coordinator().master_offset())
    }));
}

#[test]
fn test_partial_resync_after_brief_disconnect() {
    let (primary, primary_addr) = spawn_server(ServerConfig::for_testing());
    let mut feeder = TestClient::connect(primary_addr);
    feeder.command(&["SET", "seed", "1"]);
    let run_id = primary.coordinator().run_id().to_string();

    // First contact: full resync establishes the baseline offset.
    let mut probe = HandshakeProbe::connect(primary_addr);
    let reply = probe.psync("?", -1);
    assert!(reply.starts_with("+FULLRESYNC "), "got {:?}", reply);
    let baseline: u64 = reply.rsplit(' ').next().unwrap().parse().unwrap();
    assert_eq!(baseline, primary.coordinator().master_offset());
    probe.read_payload();
    drop(probe); // brief disconnect

    // Ten writes while the replica is away.
    let mut expected_bytes = 0u64;
    for i in 0..10 {
        let value = format!("value-{}", i);
        feeder.command(&["SET", &format!("missed:{}", i), &value]);
        let encoded = ember_core::encode_command(&[
            ember_core::ByteString::from("SET"),
            ember_core::ByteString::from_string(format!("missed:{}", i)),
            ember_core::ByteString::from_string(value),
        ]);
        expected_bytes += encoded.len() as u64;
    }
    assert_eq!(
        primary.coordinator().master_offset(),
        baseline + expected_bytes
    );

    // Reconnect with the saved coordinates: the primary replies +CONTINUE
    // with exactly the missed bytes.
    let mut probe = HandshakeProbe::connect(primary_addr);
    let reply = probe.psync(&run_id, baseline as i64);
    assert_eq!(reply, "+CONTINUE");
    let bulk = probe.read_payload();
    assert_eq!(bulk.len() as u64, expected_bytes);

    // Applying the bulk to a fresh keyspace reproduces the missed writes.
    let keyspace = ember_store::Keyspace::default();
    let report = ember_persist::aof::recover_slice(&bulk, &keyspace);
    assert_eq!(report.applied, 10);
    for i in 0..10 {
        let key = ember_core::ByteString::from_string(format!("missed:{}", i));
        assert!(keyspace.db(0).contains(&key), "missing key {}", i);
    }
}

#[test]
fn test_partial_resync_refused_after_backlog_eviction() {
    let config = ServerConfig {
        backlog_size: 512,
        ..ServerConfig::for_testing()
    };
    let (primary, primary_addr) = spawn_server(config);
    let mut feeder = TestClient::connect(primary_addr);
    feeder.command(&["SET", "seed", "1"]);
    let run_id = primary.coordinator().run_id().to_string();

    let mut probe = HandshakeProbe::connect(primary_addr);
    let reply = probe.psync("?", -1);
    assert!(reply.starts_with("+FULLRESYNC "));
    let baseline: u64 = reply.rsplit(' ').next().unwrap().parse().unwrap();
    probe.read_payload();
    drop(probe);

    // Push far more than the 512-byte backlog window.
    for i in 0..100 {
        feeder.command(&["SET", &format!("evict:{}", i), "xxxxxxxxxxxxxxxx"]);
    }

    let mut probe = HandshakeProbe::connect(primary_addr);
    let reply = probe.psync(&run_id, baseline as i64);
    assert!(
        reply.starts_with("+FULLRESYNC "),
        "expected full resync, got {:?}",
        reply
    );
    // The blob carries the complete current keyspace.
    let blob = probe.read_payload();
    let keyspace = ember_store::Keyspace::default();
    ember_persist::load_slice(&blob, &keyspace).unwrap();
    assert_eq!(keyspace.db(0).len(), 101);
}

#[test]
fn test_mismatched_run_id_forces_full_resync() {
    let (primary, primary_addr) = spawn_server(ServerConfig::for_testing());
    let mut feeder = TestClient::connect(primary_addr);
    feeder.command(&["SET", "seed", "1"]);

    let mut probe = HandshakeProbe::connect(primary_addr);
    let reply = probe.psync("0123456789abcdef0123456789abcdef", 0);
    assert!(reply.starts_with("+FULLRESYNC "));
    let announced: u64 = reply.rsplit(' ').next().unwrap().parse().unwrap();
    assert_eq!(announced, primary.coordinator().master_offset());
    probe.read_payload();
}

#[test]
fn test_promotion_back_to_primary() {
    let (_primary, primary_addr) = spawn_server(ServerConfig::for_testing());
    let (replica, replica_addr) = spawn_server(ServerConfig::for_testing());
    let mut admin = TestClient::connect(replica_addr);

    admin.command(&["REPLICAOF", "127.0.0.1", &primary_addr.port().to_string()]);
    assert!(wait_until(Duration::from_secs(5), || {
        replica.replica_status().is_some()
    }));
    match admin.command(&["INFO"]) {
        TestReply::Bulk(body) => {
            assert!(String::from_utf8_lossy(&body).contains("role:slave"))
        }
        other => panic!("unexpected reply {:?}", other),
    }

    assert_eq!(admin.command(&["REPLICAOF", "NO", "ONE"]), TestReply::ok());
    assert!(replica.replica_status().is_none());
    match admin.command(&["INFO"]) {
        TestReply::Bulk(body) => {
            assert!(String::from_utf8_lossy(&body).contains("role:master"))
        }
        other => panic!("unexpected reply {:?}", other),
    }
}
