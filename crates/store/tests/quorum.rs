//! Quorum behavior of [`QuorumStore`] against fake replicas.
//!
//! Each fake replica is a `std::net::TcpListener` on its own thread that
//! speaks just enough RESP to store hashes in memory.

use bytes::BytesMut;
use cregion_store::metrics::{BATCHES_COMMITTED, BATCHES_FAILED, COMMIT_LATENCY, READ_LATENCY};
use cregion_store::resp::{decode, Reply};
use cregion_store::{
    io_runtime, BatchState, CheckpointBatch, CheckpointStore, QuorumStore, StoreError,
};
use cregion_types::config::{ServerConfig, StoreConfig};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, SharedString, Unit};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_test_logger() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap(),
        )
        .try_init();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Behavior {
    /// Executes commands and replies.
    Ack,
    /// Reads commands and never replies.
    Silent,
    /// Drops the connection when the first command arrives.
    CloseOnCommand,
}

type Hashes = HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>>;

struct FakeReplica {
    address: SocketAddr,
    data: Arc<Mutex<Hashes>>,
}

impl FakeReplica {
    fn start(behavior: Behavior) -> Self {
        Self::start_with_password(behavior, None)
    }

    fn start_with_password(behavior: Behavior, password: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let data: Arc<Mutex<Hashes>> = Arc::default();
        let shared = data.clone();
        let password = password.map(str::to_string);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let data = shared.clone();
                let password = password.clone();
                thread::spawn(move || serve(stream, behavior, data, password));
            }
        });
        Self { address, data }
    }

    fn server(&self) -> ServerConfig {
        ServerConfig {
            host: self.address.ip().to_string(),
            port: self.address.port(),
            password: None,
        }
    }

    fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.data
            .lock()
            .unwrap()
            .get(&b"Dtest"[..])
            .and_then(|hash| hash.get(key.as_bytes()).cloned())
    }
}

/// Address of a port nobody listens on.
fn unreachable_server() -> ServerConfig {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    ServerConfig {
        host: address.ip().to_string(),
        port: address.port(),
        password: None,
    }
}

fn serve(
    mut stream: TcpStream,
    behavior: Behavior,
    data: Arc<Mutex<Hashes>>,
    password: Option<String>,
) {
    let mut authenticated = password.is_none();
    let mut input = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        input.extend_from_slice(&chunk[..n]);

        let mut output = BytesMut::new();
        while let Some(request) = decode(&mut input).unwrap() {
            let line = request.into_command_line().unwrap();
            match behavior {
                Behavior::Ack => {}
                Behavior::Silent => continue,
                Behavior::CloseOnCommand => return,
            }
            let reply = execute(&line, &data, password.as_deref(), &mut authenticated);
            reply.encode(&mut output);
        }
        if stream.write_all(&output).is_err() {
            return;
        }
    }
}

fn execute(
    line: &[bytes::Bytes],
    data: &Mutex<Hashes>,
    password: Option<&str>,
    authenticated: &mut bool,
) -> Reply {
    let name = String::from_utf8_lossy(&line[0]).to_uppercase();
    if name == "AUTH" {
        return if Some(&line[1][..]) == password.map(str::as_bytes) {
            *authenticated = true;
            Reply::ok()
        } else {
            Reply::Error("ERR invalid password".to_string())
        };
    }
    if !*authenticated {
        return Reply::Error("NOAUTH Authentication required.".to_string());
    }

    let mut data = data.lock().unwrap();
    let hash = data.entry(line[1].to_vec()).or_default();
    match name.as_str() {
        "HSET" => {
            let added = hash.insert(line[2].to_vec(), line[3].to_vec()).is_none();
            Reply::Integer(added as i64)
        }
        "HMSET" => {
            for pair in line[2..].chunks(2) {
                hash.insert(pair[0].to_vec(), pair[1].to_vec());
            }
            Reply::ok()
        }
        "HDEL" => Reply::Integer(hash.remove(&line[2][..]).is_some() as i64),
        "HGET" => Reply::Bulk(hash.get(&line[2][..]).cloned().map(Into::into)),
        _ => Reply::Error(format!("ERR unknown command '{name}'")),
    }
}

fn store(runtime: &Runtime, servers: Vec<ServerConfig>, num_shards: usize) -> QuorumStore {
    let num_replicas = servers.len() / num_shards;
    let config = StoreConfig {
        store_name: "test".to_string(),
        num_shards,
        num_replicas,
        servers,
        connect_timeout_ms: 1_000,
        command_timeout_ms: 1_000,
    };
    QuorumStore::new(config, runtime.handle().clone()).unwrap()
}

#[test]
fn commit_with_all_replicas() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    let replicas: Vec<_> = (0..3).map(|_| FakeReplica::start(Behavior::Ack)).collect();
    let store = store(&runtime, replicas.iter().map(FakeReplica::server).collect(), 1);

    let mut batch = store.batch();
    batch.put("k1", b"v1").unwrap();
    batch
        .put_many(&[
            ("k2".to_string(), b"v2".to_vec()),
            ("k3".to_string(), b"v3".to_vec()),
        ])
        .unwrap();
    batch.commit().unwrap();
    assert_eq!(batch.state(), BatchState::Committed);

    for replica in replicas.iter() {
        assert_eq!(replica.value("k1"), Some(b"v1".to_vec()));
        assert_eq!(replica.value("k3"), Some(b"v3".to_vec()));
    }
    assert_eq!(store.get("k2").unwrap(), Some(b"v2".to_vec()));

    store.remove("k2").unwrap();
    assert_eq!(store.get("k2").unwrap(), None);
}

#[test]
fn commit_tolerates_a_minority_of_unreachable_replicas() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    let a = FakeReplica::start(Behavior::Ack);
    let b = FakeReplica::start(Behavior::Ack);
    let store = store(&runtime, vec![a.server(), b.server(), unreachable_server()], 1);

    store.put("k", b"v").unwrap();
    assert_eq!(a.value("k"), Some(b"v".to_vec()));
    assert_eq!(b.value("k"), Some(b"v".to_vec()));
}

#[test]
fn batch_fails_fast_without_a_reachable_majority() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    let a = FakeReplica::start(Behavior::Ack);
    let store = store(
        &runtime,
        vec![a.server(), unreachable_server(), unreachable_server()],
        1,
    );

    let mut batch = store.batch();
    match batch.put("k", b"v") {
        Err(StoreError::InsufficientReplicas {
            reachable,
            required,
            ..
        }) => {
            assert_eq!(reachable, 1);
            assert_eq!(required, 2);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(batch.state(), BatchState::Error);
    assert!(matches!(
        batch.commit(),
        Err(StoreError::InvalidBatchState {
            state: BatchState::Error,
            ..
        })
    ));
    assert_eq!(a.value("k"), None);
}

#[test]
fn losing_a_minority_after_connect_still_commits() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    // Five replicas, majority three: two may fail after the batch started.
    let replicas = vec![
        FakeReplica::start(Behavior::Ack),
        FakeReplica::start(Behavior::CloseOnCommand),
        FakeReplica::start(Behavior::Ack),
        FakeReplica::start(Behavior::CloseOnCommand),
        FakeReplica::start(Behavior::Ack),
    ];
    let store = store(&runtime, replicas.iter().map(FakeReplica::server).collect(), 1);

    let mut batch = store.batch();
    batch.put("k", b"v").unwrap();
    batch.remove("old").unwrap();
    batch.commit().unwrap();
    assert_eq!(replicas[0].value("k"), Some(b"v".to_vec()));
}

#[test]
fn losing_a_majority_after_connect_fails_the_commit() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    let replicas = vec![
        FakeReplica::start(Behavior::Ack),
        FakeReplica::start(Behavior::CloseOnCommand),
        FakeReplica::start(Behavior::CloseOnCommand),
    ];
    let store = store(&runtime, replicas.iter().map(FakeReplica::server).collect(), 1);

    let mut batch = store.batch();
    batch.put("k", b"v").unwrap();
    match batch.commit() {
        Err(StoreError::NoQuorum {
            acked, required, ..
        }) => {
            assert_eq!(acked, 1);
            assert_eq!(required, 2);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(batch.state(), BatchState::Error);
}

#[test]
fn losing_one_more_than_a_minority_fails_and_hides_the_write() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    // Five replicas, majority three: losing three after the batch started
    // leaves two acknowledgements.
    let replicas = vec![
        FakeReplica::start(Behavior::CloseOnCommand),
        FakeReplica::start(Behavior::Ack),
        FakeReplica::start(Behavior::CloseOnCommand),
        FakeReplica::start(Behavior::Ack),
        FakeReplica::start(Behavior::CloseOnCommand),
    ];
    let store = store(&runtime, replicas.iter().map(FakeReplica::server).collect(), 1);

    let mut batch = store.batch();
    batch.put("k", b"v").unwrap();
    match batch.commit() {
        Err(StoreError::NoQuorum {
            acked, required, ..
        }) => {
            assert_eq!(acked, 2);
            assert_eq!(required, 3);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(batch.state(), BatchState::Error);

    // The survivors hold the value, but two answers are not a quorum.
    assert_eq!(replicas[1].value("k"), Some(b"v".to_vec()));
    for _ in 0..10 {
        assert!(matches!(
            store.get("k"),
            Err(StoreError::NoQuorum {
                acked: 2,
                required: 3,
                ..
            })
        ));
    }
}

#[test]
fn silent_minority_does_not_block_quorum() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    let replicas = vec![
        FakeReplica::start(Behavior::Ack),
        FakeReplica::start(Behavior::Silent),
        FakeReplica::start(Behavior::Ack),
    ];
    let store = store(&runtime, replicas.iter().map(FakeReplica::server).collect(), 1);

    let mut batch = store.batch();
    batch.put("k", b"v").unwrap();
    batch.commit().unwrap();
}

#[test]
fn silent_majority_times_out() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    let replicas = vec![
        FakeReplica::start(Behavior::Ack),
        FakeReplica::start(Behavior::Silent),
        FakeReplica::start(Behavior::Silent),
    ];
    let store = store(&runtime, replicas.iter().map(FakeReplica::server).collect(), 1);

    let mut batch = store.batch();
    batch.put("k", b"v").unwrap();
    assert!(matches!(batch.commit(), Err(StoreError::Timeout { .. })));
    assert_eq!(batch.state(), BatchState::Error);
}

#[test]
fn writes_are_spread_over_shards() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    // Two shards, three replicas each: servers 0, 2, 4 hold shard 0.
    let replicas: Vec<_> = (0..6).map(|_| FakeReplica::start(Behavior::Ack)).collect();
    let store = store(&runtime, replicas.iter().map(FakeReplica::server).collect(), 2);

    let entries: Vec<(String, Vec<u8>)> = (0..20)
        .map(|i| (format!("key{i}"), format!("value{i}").into_bytes()))
        .collect();
    store.put_many(&entries).unwrap();

    for (key, value) in entries.iter() {
        let shard = store.pool().shard_of(key);
        for server in store.pool().replicas_of(shard) {
            assert_eq!(replicas[server].value(key).as_ref(), Some(value));
        }
        let other = 1 - shard;
        for server in store.pool().replicas_of(other) {
            assert_eq!(replicas[server].value(key), None);
        }
        assert_eq!(store.get(key).unwrap().as_ref(), Some(value));
    }
}

#[test]
fn reads_fall_back_from_failed_replicas() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    let replicas = vec![
        FakeReplica::start(Behavior::Ack),
        FakeReplica::start(Behavior::CloseOnCommand),
        FakeReplica::start(Behavior::Ack),
    ];
    let store = store(&runtime, replicas.iter().map(FakeReplica::server).collect(), 1);
    store.put("k", b"v").unwrap();

    // The preferred replica is random; every read must find the value
    // whichever replica is asked first.
    for _ in 0..20 {
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get("missing").unwrap(), None);
    }
}

#[test]
fn read_without_quorum_fails() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    let a = FakeReplica::start(Behavior::Ack);
    let store = store(
        &runtime,
        vec![a.server(), unreachable_server(), unreachable_server()],
        1,
    );

    assert!(matches!(
        store.get("missing"),
        Err(StoreError::NoQuorum {
            acked: 1,
            required: 2,
            ..
        })
    ));
}

#[test]
fn authenticates_when_password_is_set() {
    init_test_logger();
    let runtime = io_runtime(2).unwrap();
    let replicas: Vec<_> = (0..3)
        .map(|_| FakeReplica::start_with_password(Behavior::Ack, Some("secret")))
        .collect();

    let with_password = |password: &str| {
        replicas
            .iter()
            .map(|replica| ServerConfig {
                password: Some(password.to_string()),
                ..replica.server()
            })
            .collect::<Vec<_>>()
    };

    let good = store(&runtime, with_password("secret"), 1);
    good.put("k", b"v").unwrap();
    assert_eq!(replicas[1].value("k"), Some(b"v".to_vec()));

    let bad = store(&runtime, with_password("wrong"), 1);
    assert!(matches!(
        bad.put("k", b"w"),
        Err(StoreError::InsufficientReplicas { reachable: 0, .. })
    ));
    assert_eq!(replicas[1].value("k"), Some(b"v".to_vec()));
}

/// Remembers which metrics were described.
#[derive(Default)]
struct Descriptions(Mutex<Vec<String>>);

impl metrics::Recorder for Descriptions {
    fn describe_counter(&self, key: KeyName, _unit: Option<Unit>, _description: SharedString) {
        self.0.lock().unwrap().push(key.as_str().to_string());
    }

    fn describe_gauge(&self, key: KeyName, _unit: Option<Unit>, _description: SharedString) {
        self.0.lock().unwrap().push(key.as_str().to_string());
    }

    fn describe_histogram(&self, key: KeyName, _unit: Option<Unit>, _description: SharedString) {
        self.0.lock().unwrap().push(key.as_str().to_string());
    }

    fn register_counter(&self, _key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::noop()
    }

    fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

#[test]
fn new_store_describes_its_metrics() {
    init_test_logger();
    let runtime = io_runtime(1).unwrap();
    let replica = FakeReplica::start(Behavior::Ack);
    let recorder = Descriptions::default();
    let _store = metrics::with_local_recorder(&recorder, || {
        store(&runtime, vec![replica.server()], 1)
    });
    let described = recorder.0.lock().unwrap().clone();
    for name in [BATCHES_COMMITTED, BATCHES_FAILED, COMMIT_LATENCY, READ_LATENCY] {
        assert!(described.iter().any(|key| key == name), "{name} not described");
    }
}
