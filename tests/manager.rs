//! Integration tests for the forward manager: lifecycle, persistence,
//! groups, reconciliation, and hot reload, all driven through real loopback
//! sockets.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::{
    ephemeral_manager, eventually, free_port, manager_with_store, round_trip, socket_forward,
    spawn_echo_server,
};
use kubeportal::config::{ConfigFile, ConfigStore};
use kubeportal::Error;

#[tokio::test]
async fn socket_forward_relays_and_counts_bytes() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let local_port = free_port().await;
    let manager = ephemeral_manager();

    manager
        .add_or_update(socket_forward(
            "postgres-local",
            "default",
            local_port,
            echo_port,
            true,
        ))
        .await
        .unwrap();

    let reply = round_trip(local_port, b"hi").await;
    assert_eq!(&reply, b"hi");

    let forwarder = manager.forwarder("postgres-local").unwrap();
    assert!(forwarder.is_active());
    // Byte accounting is chunk-granular; give the pump a beat to add the
    // final chunk.
    assert!(
        eventually(
            || forwarder.bytes_transferred() >= 2,
            Duration::from_secs(2)
        )
        .await,
        "expected at least 2 bytes accounted, saw {}",
        forwarder.bytes_transferred()
    );

    manager.stop_all().await;
}

#[tokio::test]
async fn group_disable_stops_and_enable_restarts_members() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let manager = ephemeral_manager();

    let redis_port = free_port().await;
    let memcached_port = free_port().await;
    manager
        .add_or_update(socket_forward(
            "cache-redis",
            "cache",
            redis_port,
            echo_port,
            true,
        ))
        .await
        .unwrap();
    manager
        .add_or_update(socket_forward(
            "cache-memcached",
            "cache",
            memcached_port,
            echo_port,
            true,
        ))
        .await
        .unwrap();
    assert_eq!(manager.active_count(), 2);

    manager.disable_group("cache").await.unwrap();
    assert_eq!(manager.active_count(), 0);
    assert!(!manager.get("cache-redis").await.unwrap().enabled());
    assert!(TcpStream::connect(("127.0.0.1", redis_port)).await.is_err());

    manager.enable_group("cache").await.unwrap();
    assert_eq!(manager.active_count(), 2);

    let groups = manager.group_statuses().await;
    let cache = &groups["cache"];
    assert!(cache.enabled);
    assert_eq!(cache.forward_count, 2);
    assert_eq!(cache.active_forward_count, 2);

    manager.stop_all().await;
}

#[tokio::test]
async fn enable_group_fails_for_unknown_group() {
    let manager = ephemeral_manager();
    let result = manager.enable_group("nope").await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn bind_conflict_stores_disabled_and_persists() {
    // Hold the port so the forwarder's bind must fail.
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken_port = blocker.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("config.json"));
    let manager = manager_with_store(store.clone());

    let err = manager
        .add_or_update(socket_forward("clash", "default", taken_port, 9999, true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AddressInUse(p) if p == taken_port));
    assert!(err.to_string().contains("already in use"));

    // Stored, but disabled - in memory and on disk.
    let stored = manager.get("clash").await.unwrap();
    assert!(!stored.enabled());
    let on_disk = store.load().unwrap();
    assert!(!on_disk.forwards["clash"].enabled());
}

#[tokio::test]
async fn invalid_definition_leaves_registry_unchanged() {
    let manager = ephemeral_manager();
    manager
        .add_or_update(socket_forward("good", "default", free_port().await, 9999, false))
        .await
        .unwrap();

    let bad = socket_forward("bad", "default", 1234, 9999, false);
    let bad = match bad {
        kubeportal::forward::ForwardDefinition::Socket(mut s) => {
            s.remote_host.clear();
            kubeportal::forward::ForwardDefinition::Socket(s)
        }
        other => other,
    };
    let err = manager.add_or_update(bad).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let all = manager.get_all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name(), "good");
}

#[tokio::test]
async fn names_stay_unique_across_updates_and_deletes() {
    let manager = ephemeral_manager();
    let port = free_port().await;

    manager
        .add_or_update(socket_forward("dup", "default", port, 1111, false))
        .await
        .unwrap();
    manager
        .add_or_update(socket_forward("dup", "other", port, 2222, false))
        .await
        .unwrap();
    assert_eq!(manager.total_count().await, 1);
    assert_eq!(manager.get("dup").await.unwrap().group(), "other");

    assert!(manager.delete("dup").await.unwrap());
    assert!(!manager.delete("dup").await.unwrap());
    assert_eq!(manager.total_count().await, 0);
}

#[tokio::test]
async fn registry_survives_a_reload_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    let first = manager_with_store(ConfigStore::new(path.clone()));
    first
        .add_or_update(socket_forward("alpha", "dev", free_port().await, 1111, false))
        .await
        .unwrap();
    first
        .add_or_update(socket_forward("beta", "prod", free_port().await, 2222, false))
        .await
        .unwrap();
    let before = first.get_all().await;

    let second = manager_with_store(ConfigStore::new(path));
    second.initialize().await;
    assert_eq!(second.get_all().await, before);
}

#[tokio::test]
async fn start_and_stop_follow_running_state() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let local_port = free_port().await;
    let manager = ephemeral_manager();

    assert!(matches!(
        manager.start("ghost").await,
        Err(Error::NotFound(_))
    ));
    assert!(!manager.stop("ghost").await.unwrap());

    manager
        .add_or_update(socket_forward("pg", "default", local_port, echo_port, false))
        .await
        .unwrap();
    assert!(!manager.stop("pg").await.unwrap(), "not running yet");

    manager.start("pg").await.unwrap();
    assert!(manager.get("pg").await.unwrap().enabled());
    assert!(manager.forwarder("pg").is_some());
    // Starting a running forward is a no-op.
    manager.start("pg").await.unwrap();
    assert_eq!(manager.active_count(), 1);

    assert!(manager.stop("pg").await.unwrap());
    assert!(!manager.get("pg").await.unwrap().enabled());
    assert!(manager.forwarder("pg").is_none());
}

#[tokio::test]
async fn start_and_stop_are_persisted() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let store = ConfigStore::new(path.clone());

    let manager = manager_with_store(store.clone());
    manager
        .add_or_update(socket_forward(
            "pg",
            "default",
            free_port().await,
            echo_port,
            false,
        ))
        .await
        .unwrap();

    manager.start("pg").await.unwrap();
    assert!(store.load().unwrap().forwards["pg"].enabled());

    manager.stop("pg").await.unwrap();
    assert!(!store.load().unwrap().forwards["pg"].enabled());
}

#[tokio::test]
async fn reload_config_replaces_the_running_set() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    let manager = manager_with_store(ConfigStore::new(path.clone()));
    let port_a = free_port().await;
    manager
        .add_or_update(socket_forward("A", "default", port_a, echo_port, true))
        .await
        .unwrap();

    // Rewrite the file out-of-band and reload explicitly.
    let port_b = free_port().await;
    let mut next = ConfigFile::default();
    next.forwards.insert(
        "B".to_string(),
        socket_forward("B", "default", port_b, echo_port, true),
    );
    std::fs::write(&path, next.to_json().unwrap()).unwrap();

    manager.reload_config().await.unwrap();
    assert!(manager.get("A").await.is_none());
    assert!(manager.forwarder("A").is_none());
    assert!(manager.forwarder("B").is_some());
    assert_eq!(&round_trip(port_b, b"post-reload").await, b"post-reload");

    manager.stop_all().await;
}

#[tokio::test]
async fn disabling_via_upsert_keeps_open_connections_alive() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let local_port = free_port().await;
    let manager = ephemeral_manager();

    let def = socket_forward("sticky", "default", local_port, echo_port, true);
    manager.add_or_update(def.clone()).await.unwrap();

    let mut conn = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // Only the enabled flag changes: no restart, the connection survives.
    let mut disabled = def.clone();
    disabled.set_enabled(false);
    manager.add_or_update(disabled).await.unwrap();
    assert!(!manager.get("sticky").await.unwrap().enabled());

    conn.write_all(b"pong").await.unwrap();
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    manager.stop_all().await;
}

#[tokio::test]
async fn routing_change_restarts_and_drops_connections() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let old_port = free_port().await;
    let manager = ephemeral_manager();

    let def = socket_forward("mover", "default", old_port, echo_port, true);
    manager.add_or_update(def).await.unwrap();

    let mut conn = TcpStream::connect(("127.0.0.1", old_port)).await.unwrap();
    conn.write_all(b"pre").await.unwrap();
    let mut buf = [0u8; 3];
    conn.read_exact(&mut buf).await.unwrap();

    // Move the listener; the old connection is torn down once the drain
    // grace elapses and a fresh listener comes up on the new port.
    let new_port = free_port().await;
    manager
        .add_or_update(socket_forward("mover", "default", new_port, echo_port, true))
        .await
        .unwrap();

    let mut probe = [0u8; 1];
    match conn.read(&mut probe).await {
        Ok(0) => {}
        Ok(_) => panic!("old connection should not deliver data after restart"),
        Err(_) => {}
    }
    assert!(TcpStream::connect(("127.0.0.1", old_port)).await.is_err());
    assert_eq!(&round_trip(new_port, b"post").await, b"post");

    manager.stop_all().await;
}

#[tokio::test]
async fn stop_completes_within_the_grace_period() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let local_port = free_port().await;
    let manager = ephemeral_manager();

    manager
        .add_or_update(socket_forward("slow", "default", local_port, echo_port, true))
        .await
        .unwrap();

    // An idle connection that never closes forces stop to ride out the
    // full drain grace.
    let _conn = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    assert!(manager.stop("slow").await.unwrap());
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert!(manager.forwarder("slow").is_none());
    assert!(!manager.get("slow").await.unwrap().enabled());
}

#[tokio::test]
async fn remote_recovery_serves_new_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_port = listener.local_addr().unwrap().port();
    let echo = tokio::spawn(common::echo_loop(listener));

    let local_port = free_port().await;
    let manager = ephemeral_manager();
    manager
        .add_or_update(socket_forward("flaky", "default", local_port, echo_port, true))
        .await
        .unwrap();
    assert_eq!(&round_trip(local_port, b"one").await, b"one");

    // Remote goes down: connects through the forwarder now fail, and the
    // client side is simply closed.
    echo.abort();
    let _ = echo.await;
    let mut conn = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    let mut probe = [0u8; 1];
    match conn.read(&mut probe).await {
        Ok(0) | Err(_) => {}
        Ok(_) => panic!("no data expected with the remote down"),
    }
    assert!(manager.forwarder("flaky").unwrap().is_active());

    // Remote returns on the same address; new connections work again.
    let listener = TcpListener::bind(("127.0.0.1", echo_port)).await.unwrap();
    let _echo = tokio::spawn(common::echo_loop(listener));
    assert_eq!(&round_trip(local_port, b"two").await, b"two");

    manager.stop_all().await;
}

#[tokio::test]
async fn apply_config_merges_into_target_group() {
    let manager = ephemeral_manager();
    let port_a = free_port().await;
    let port_c = free_port().await;
    let port_x = free_port().await;

    manager
        .add_or_update(socket_forward("A", "dev", port_a, 1111, false))
        .await
        .unwrap();
    manager
        .add_or_update(socket_forward("C", "dev", port_c, 2222, false))
        .await
        .unwrap();
    manager
        .add_or_update(socket_forward("X", "prod", port_x, 3333, false))
        .await
        .unwrap();

    let port_b = free_port().await;
    let payload = serde_json::json!({
        "forwards": {
            "A": {
                "type": "socket", "name": "A", "group": "dev",
                "localPort": port_a, "enabled": false,
                "remoteHost": "127.0.0.1", "remotePort": 4444
            },
            "B": {
                "type": "socket", "name": "B", "group": "dev",
                "localPort": port_b, "enabled": false,
                "remoteHost": "127.0.0.1", "remotePort": 5555
            }
        }
    })
    .to_string();

    let outcome = manager
        .apply_config(&payload, Some("dev"), true)
        .await
        .unwrap();
    assert_eq!(outcome.added, 1);
    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.removed, 1);

    // A updated, B added, C removed, X (out of scope) untouched.
    assert!(manager.get("A").await.is_some());
    assert!(manager.get("B").await.is_some());
    assert!(manager.get("C").await.is_none());
    assert_eq!(manager.get("X").await.unwrap().group(), "prod");
}

#[tokio::test]
async fn apply_config_skips_malformed_entries() {
    let manager = ephemeral_manager();
    let ok_port = free_port().await;
    let payload = serde_json::json!({
        "forwards": {
            "ok": {
                "type": "socket", "name": "ok", "localPort": ok_port,
                "enabled": false, "remoteHost": "127.0.0.1", "remotePort": 9999
            },
            "mystery": { "type": "carrier-pigeon", "localPort": 1 }
        }
    })
    .to_string();

    let outcome = manager.apply_config(&payload, None, false).await.unwrap();
    assert_eq!(outcome.added, 1);
    assert_eq!(manager.total_count().await, 1);
    assert!(manager.get("mystery").await.is_none());
}

#[tokio::test]
async fn export_filters_disabled_and_foreign_groups() {
    let manager = ephemeral_manager();
    let (echo_port, _echo) = spawn_echo_server().await;

    manager
        .add_or_update(socket_forward("A", "dev", free_port().await, echo_port, true))
        .await
        .unwrap();
    manager
        .add_or_update(socket_forward("B", "dev", free_port().await, echo_port, false))
        .await
        .unwrap();
    manager
        .add_or_update(socket_forward("X", "prod", free_port().await, echo_port, true))
        .await
        .unwrap();

    let exported = manager.export_config(false, Some("dev")).await.unwrap();
    let parsed = ConfigFile::from_json(&exported).unwrap();
    assert_eq!(parsed.forwards.len(), 1);
    assert!(parsed.forwards.contains_key("A"));

    let everything = manager.export_config(true, None).await.unwrap();
    let parsed = ConfigFile::from_json(&everything).unwrap();
    assert_eq!(parsed.forwards.len(), 3);

    manager.stop_all().await;
}

#[tokio::test]
async fn hot_reload_converges_on_out_of_band_edits() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let store = ConfigStore::new(path.clone());

    let manager = manager_with_store(store.clone());
    manager.initialize().await;
    let port_a = free_port().await;
    manager
        .add_or_update(socket_forward("A", "default", port_a, echo_port, true))
        .await
        .unwrap();

    let watcher = manager.clone().spawn_config_watcher().unwrap().unwrap();
    // Let the watcher settle before editing out-of-band.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Out-of-band edit: drop A, introduce B.
    let port_b = free_port().await;
    let mut next = ConfigFile::default();
    next.forwards.insert(
        "B".to_string(),
        socket_forward("B", "default", port_b, echo_port, true),
    );
    std::fs::write(&path, next.to_json().unwrap()).unwrap();

    let converged = eventually(
        || manager.forwarder("B").is_some() && manager.forwarder("A").is_none(),
        Duration::from_secs(5),
    )
    .await;
    assert!(converged, "manager did not reconverge on the edited config");
    assert_eq!(&round_trip(port_b, b"hot").await, b"hot");
    assert!(manager.get("A").await.is_none());

    watcher.abort();
    manager.stop_all().await;
}
