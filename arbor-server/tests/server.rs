//! End-to-end server tests: real sockets, real handler threads, one
//! engine behind the lock.

use std::sync::Arc;
use std::thread;

use arbor_core::{Db, ServerDb};
use arbor_net::{Client, ClientError};
use arbor_server::Server;
use parking_lot::Mutex;
use rand::Rng;

fn start_server() -> (Server, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = ServerDb::from_db(Db::empty(dir.path().join("db.json")));
    let server = Server::start("127.0.0.1", 0, Arc::new(Mutex::new(db)), true).unwrap();
    (server, dir)
}

fn client_for(server: &Server) -> Client {
    Client::localhost(server.port())
}

fn args(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

#[test]
fn set_and_get_over_the_wire() {
    let (server, _dir) = start_server();
    let client = client_for(&server);

    client.set(&["apple"], &serde_json::json!("sauce")).unwrap();
    assert_eq!(
        client.get(&["apple"]).unwrap(),
        Some(serde_json::json!("sauce"))
    );
}

#[test]
fn errors_come_back_as_reply_lines() {
    let (server, _dir) = start_server();
    let client = client_for(&server);

    client.set(&["scalar"], &serde_json::json!("x")).unwrap();
    let err = client.query(&args(&["scalar", "deeper"])).unwrap_err();
    match err {
        ClientError::Db(line) => assert!(line.starts_with("error:"), "{line}"),
        other => panic!("expected a database error, got {other:?}"),
    }
}

#[test]
fn leading_flags_apply_per_query() {
    let (server, _dir) = start_server();
    let client = client_for(&server);

    client.query(&args(&["a", "b", "=", "deep"])).unwrap();
    let raw = client.query_raw(&args(&["-c", "a", "b"])).unwrap();
    assert_eq!(raw, "a = b = deep\n");

    let err = client.query(&args(&["-s", "ghost"])).unwrap_err();
    assert!(matches!(err, ClientError::Db(_)));

    // the next query on the same session is back to non-strict
    assert_eq!(client.query(&args(&["ghost"])).unwrap(), Vec::<String>::new());
}

#[test]
fn repeated_reads_hit_the_cache() {
    let (server, _dir) = start_server();
    let client = client_for(&server);
    let db = server.db();

    client.query(&args(&["k", "=", "v"])).unwrap();
    assert_eq!(db.lock().cache_len(), 0);

    client.query(&args(&["k"])).unwrap();
    client.query(&args(&["k"])).unwrap();
    assert_eq!(db.lock().cache_len(), 1);

    client.query(&args(&["k", "=", "other"])).unwrap();
    assert_eq!(db.lock().cache_len(), 0);
}

#[test]
fn one_session_carries_many_queries() {
    let (server, _dir) = start_server();
    let client = client_for(&server);

    for i in 0..50 {
        let key = format!("key-{i}");
        let value = format!("value-{i}");
        client.query(&args(&[&key, "=", &value])).unwrap();
        assert_eq!(client.query(&args(&[&key])).unwrap(), vec![value]);
    }
}

#[test]
fn stateful_servers_persist_writes_to_a_compressed_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");
    let db = Arc::new(Mutex::new(ServerDb::from_db(Db::empty(&path))));

    let mut persister = arbor_core::Persister::spawn(db.clone());
    let server = Server::start("127.0.0.1", 0, db, true).unwrap();
    let client = client_for(&server);

    client
        .set(&["durable"], &serde_json::json!("yes"))
        .unwrap();
    persister.stop();

    // writers always compress
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.first(), Some(&0x78), "snapshot is not zlib data");

    let reloaded = arbor_core::persist::load(&path).unwrap();
    let durable = reloaded
        .as_map()
        .and_then(|m| m.get("durable"))
        .cloned();
    assert_eq!(durable, Some(arbor_core::Value::String("yes".to_string())));
}

#[test]
fn teardown_disconnects_live_clients() {
    let (mut server, _dir) = start_server();
    let client = client_for(&server);
    client.query(&args(&["still", "=", "up"])).unwrap();

    server.teardown();

    assert!(client.query(&args(&["still"])).is_err());
}

#[test]
fn stats_count_connections_queries_and_errors() {
    let (server, _dir) = start_server();
    let client = client_for(&server);
    let stats = server.stats();

    client.query(&args(&["a", "=", "b"])).unwrap();
    client.query(&args(&["a"])).unwrap();
    let _ = client.query(&args(&["a", "deeper"]));

    // handlers update the counters before replying, so they are
    // current as soon as the replies are in
    let snapshot = stats.lock();
    assert_eq!(snapshot.connections_total(), 1);
    assert_eq!(snapshot.queries_total(), 3);
    assert_eq!(snapshot.errors_total(), 1);
}

#[test]
fn unicode_payloads_survive_the_wire() {
    let (server, _dir) = start_server();
    let client = client_for(&server);

    client
        .set(&["greeting"], &serde_json::json!("héllo wörld ✓"))
        .unwrap();
    assert_eq!(
        client.get(&["greeting"]).unwrap(),
        Some(serde_json::json!("héllo wörld ✓"))
    );
    assert_eq!(
        client.query(&args(&["greeting"])).unwrap(),
        vec!["héllo wörld ✓"]
    );
}

#[test]
fn large_values_round_trip() {
    let (server, _dir) = start_server();
    let client = client_for(&server);

    let value = serde_json::Value::String("x".repeat(128 * 1024));
    client.set(&["blob"], &value).unwrap();
    assert_eq!(client.get(&["blob"]).unwrap(), Some(value));
}

#[test]
fn concurrent_fuzz_never_drops_a_reply() {
    let (server, _dir) = start_server();
    let port = server.port();

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            thread::spawn(move || {
                let client = Client::localhost(port);
                let mut rng = rand::thread_rng();
                for round in 0..40 {
                    let key = format!("w{worker}");
                    let value = format!("{}", rng.gen_range(0..10_000));
                    let query: Vec<String> = match rng.gen_range(0..4) {
                        0 => args(&[&key, "=", &value]),
                        1 => args(&[&key, "+", &value]),
                        2 => args(&[&key]),
                        _ => args(&[&key, "--del"]),
                    };
                    // every frame gets exactly one reply; Db errors are
                    // fine (popping absent keys and such), hangs are not
                    match client.query(&query) {
                        Ok(_) | Err(ClientError::Db(_)) => {}
                        Err(other) => panic!("worker {worker} round {round}: {other:?}"),
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    // the engine survived and still answers
    let client = Client::localhost(port);
    client.query(&args(&["done", "=", "yes"])).unwrap();
    assert_eq!(client.query(&args(&["done"])).unwrap(), vec!["yes"]);
}
