//! End-to-end object scenarios against a single target

mod common;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use common::{call, delete, get, get_json, lbmap, node, node_with, put, put_json, smap};
use nimbus_common::{ActionMsg, Checksum, ObjectKey};
use serde_json::json;
use std::time::Duration;
use tower::ServiceExt;

fn hex(data: &[u8]) -> String {
    Checksum::compute(data).to_hex()
}

#[tokio::test]
async fn scenario_a_put_then_get() {
    let n = node("t1");

    let reply = call(&n.app, put("/v1/files/b/o1", "hello", None)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.checksum(), Some(hex(b"hello").as_str()));

    let reply = call(&n.app, get("/v1/files/b/o1")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "hello");
    assert_eq!(reply.checksum(), Some(hex(b"hello").as_str()));
    assert_eq!(
        Checksum::compute(&reply.body).to_hex(),
        reply.checksum().unwrap()
    );
}

#[tokio::test]
async fn scenario_b_local_bucket_lifecycle() {
    let n = node("t1");
    let sync_lb = "/v1/daemon/synclb";

    assert_eq!(call(&n.app, put_json(sync_lb, &lbmap(1, &[]))).await.status, StatusCode::OK);
    assert_eq!(call(&n.app, put_json(sync_lb, &lbmap(2, &["lb"]))).await.status, StatusCode::OK);
    for dir in n.target.mounts().bucket_dirs("lb", true) {
        assert!(dir.is_dir());
    }

    let reply = call(&n.app, get("/v1/files/lb/missing")).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.json()["status"], 404);

    assert_eq!(call(&n.app, put("/v1/files/lb/o1", "x", None)).await.status, StatusCode::OK);
    let reply = call(&n.app, get("/v1/files/lb/o1")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "x");
    // Local buckets never touch the cloud
    assert_eq!(n.cloud.puts(), 0);

    assert_eq!(call(&n.app, put_json(sync_lb, &lbmap(3, &[]))).await.status, StatusCode::OK);
    for dir in n.target.mounts().bucket_dirs("lb", true) {
        assert!(!dir.exists());
    }
    assert_eq!(
        call(&n.app, get("/v1/files/lb/o1")).await.status,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn scenario_c_single_cold_fetch() {
    let n = node("t1");
    n.cloud.insert("cb", "o1", "from the cloud");
    n.cloud.set_get_delay(Duration::from_millis(200));

    let (first, second) = tokio::join!(
        call(&n.app, get("/v1/files/cb/o1")),
        call(&n.app, get("/v1/files/cb/o1")),
    );
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(first.body, "from the cloud");
    assert_eq!(first.body, second.body);
    assert_eq!(first.checksum(), second.checksum());
    assert_eq!(n.cloud.gets(), 1);

    let stats = n.target.stats().snapshot();
    assert_eq!(stats.numcoldget, 1);
    assert_eq!(stats.numget, 2);

    // Now cached and valid
    call(&n.app, get("/v1/files/cb/o1")).await;
    assert_eq!(n.cloud.gets(), 1);
}

#[tokio::test]
async fn cold_fetch_failure_leaves_nothing() {
    let n = node("t1");
    n.cloud.insert("cb", "o", "data");
    n.cloud.set_failing(true);

    let reply = call(&n.app, get("/v1/files/cb/o")).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    let key = ObjectKey::new("cb", "o").unwrap();
    assert!(!n.target.fqn(&key).0.exists());

    let reply = call(&n.app, get("/v1/files/cb/absent")).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    n.cloud.set_failing(false);
    let reply = call(&n.app, get("/v1/files/cb/absent")).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn interrupted_put_leaves_prior_content() {
    let n = node("t1");
    call(&n.app, put_json("/v1/daemon/synclb", &lbmap(1, &["lb"]))).await;
    call(&n.app, put("/v1/files/lb/o", "complete v1", None)).await;

    // Client stream breaks after the first chunk
    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from_static(b"partial v2 ")),
        Err(std::io::Error::other("connection reset")),
    ];
    let body = Body::from_stream(futures::stream::iter(chunks));
    let reply = call(&n.app, put("/v1/files/lb/o", body, None)).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);

    let reply = call(&n.app, get("/v1/files/lb/o")).await;
    assert_eq!(reply.body, "complete v1");

    // A cloud upload failure is the same: staging discarded, old copy served
    call(&n.app, put("/v1/files/cb/o", "cloud v1", None)).await;
    n.cloud.set_failing(true);
    let reply = call(&n.app, put("/v1/files/cb/o", "cloud v2", None)).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    let reply = call(&n.app, get("/v1/files/cb/o")).await;
    assert_eq!(reply.body, "cloud v1");

    for mpath in n.target.mounts().mpaths() {
        assert_eq!(std::fs::read_dir(mpath.staging_dir()).unwrap().count(), 0);
    }
}

#[tokio::test]
async fn put_with_matching_checksum_is_noop() {
    let n = node("t1");
    let sum = hex(b"same bytes");

    let reply = call(&n.app, put("/v1/files/cb/o", "same bytes", Some(&sum))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let key = ObjectKey::new("cb", "o").unwrap();
    let fqn = n.target.fqn(&key).0;
    let before = std::fs::metadata(&fqn).unwrap().modified().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let reply = call(&n.app, put("/v1/files/cb/o", "same bytes", Some(&sum))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.checksum(), Some(sum.as_str()));

    assert_eq!(std::fs::metadata(&fqn).unwrap().modified().unwrap(), before);
    assert_eq!(n.cloud.puts(), 1);
}

#[tokio::test]
async fn checksum_round_trip_and_mismatch() {
    let n = node("t1");
    let sum = hex(b"payload");

    let reply = call(&n.app, put("/v1/files/cb/o", "payload", Some(&sum))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let reply = call(&n.app, get("/v1/files/cb/o")).await;
    assert_eq!(reply.checksum(), Some(sum.as_str()));
    assert_eq!(Checksum::compute(&reply.body).to_hex(), sum);

    let reply = call(&n.app, put("/v1/files/cb/o", "tampered", Some(&sum))).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(reply.json()["message"].as_str().unwrap().contains("checksum"));
    assert_eq!(call(&n.app, get("/v1/files/cb/o")).await.body, "payload");

    let reply = call(&n.app, put("/v1/files/cb/o", "x", Some("not-hex"))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn readers_share_writers_exclude() {
    let n = node_with("t1", "http://127.0.0.1:1", |config| {
        config.lock.timeout_ms = 200;
    });
    call(&n.app, put_json("/v1/daemon/synclb", &lbmap(1, &["lb"]))).await;
    call(&n.app, put("/v1/files/lb/o", "v1", None)).await;

    // An unread response body keeps its shared lock
    let held = n.app.clone().oneshot(get("/v1/files/lb/o")).await.unwrap();
    assert_eq!(held.status(), StatusCode::OK);

    let reply = call(&n.app, get("/v1/files/lb/o")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "v1");

    let reply = call(&n.app, put("/v1/files/lb/o", "v2", None)).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(reply.json()["message"].as_str().unwrap().contains("lock"));

    let body = axum::body::to_bytes(held.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, "v1");

    assert_eq!(call(&n.app, put("/v1/files/lb/o", "v2", None)).await.status, StatusCode::OK);
    assert_eq!(call(&n.app, get("/v1/files/lb/o")).await.body, "v2");
}

#[tokio::test]
async fn concurrent_puts_leave_one_complete_object() {
    let n = node("t1");
    let a = "a".repeat(64 * 1024);
    let b = "b".repeat(64 * 1024);

    let (ra, rb) = tokio::join!(
        call(&n.app, put("/v1/files/cb/o", a.clone(), None)),
        call(&n.app, put("/v1/files/cb/o", b.clone(), None)),
    );
    assert_eq!(ra.status, StatusCode::OK);
    assert_eq!(rb.status, StatusCode::OK);

    let reply = call(&n.app, get("/v1/files/cb/o")).await;
    assert!(reply.body == a.as_bytes() || reply.body == b.as_bytes());
    assert_eq!(
        reply.checksum().unwrap(),
        Checksum::compute(&reply.body).to_hex()
    );
}

#[tokio::test]
async fn delete_object_paths() {
    let n = node("t1");
    call(&n.app, put("/v1/files/cb/o", "x", None)).await;

    assert_eq!(call(&n.app, delete("/v1/files/cb/o")).await.status, StatusCode::OK);
    assert!(n.cloud.object("cb", "o").is_none());
    assert_eq!(
        call(&n.app, delete("/v1/files/cb/o")).await.status,
        StatusCode::NOT_FOUND
    );

    call(&n.app, put_json("/v1/daemon/synclb", &lbmap(1, &["lb"]))).await;
    assert_eq!(
        call(&n.app, delete("/v1/files/lb/none")).await.status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(n.target.stats().snapshot().numdelete, 1);
}

#[tokio::test]
async fn map_versions_only_move_forward() {
    let n = node("t1");
    let two = [("t1", "http://t1"), ("t2", "http://t2")];

    let reply = call(&n.app, put_json("/v1/daemon/syncsmap", &smap(2, &two))).await;
    assert_eq!(reply.status, StatusCode::OK);
    for stale in [smap(2, &[("t1", "http://t1")]), smap(1, &[("t1", "http://t1")])] {
        let reply = call(&n.app, put_json("/v1/daemon/syncsmap", &stale)).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(n.target.smap().version, 2);
        assert_eq!(n.target.smap().len(), 2);
    }

    // A map without this target is refused
    let reply = call(&n.app, put_json("/v1/daemon/syncsmap", &smap(3, &[("t2", "http://t2")]))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(n.target.smap().version, 2);

    call(&n.app, put_json("/v1/daemon/synclb", &lbmap(2, &["lb"]))).await;
    for stale in [lbmap(2, &[]), lbmap(1, &[])] {
        call(&n.app, put_json("/v1/daemon/synclb", &stale)).await;
        assert!(n.target.is_local("lb"));
        for dir in n.target.mounts().bucket_dirs("lb", true) {
            assert!(dir.is_dir());
        }
    }
}

#[tokio::test]
async fn transfer_replay_is_idempotent() {
    let n = node("t2");
    let sum = hex(b"moved");
    let uri = "/v1/files/from_id/t1/to_id/t2/cb/dir/o";

    let reply = call(&n.app, put(uri, "moved", Some(&sum))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let reply = call(&n.app, put(uri, "moved", Some(&sum))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.checksum(), Some(sum.as_str()));

    let stats = n.target.stats().snapshot();
    assert_eq!(stats.numrecvfile, 1);
    assert_eq!(stats.numput, 0);
    assert_eq!(n.cloud.puts(), 0);
    assert_eq!(call(&n.app, get("/v1/files/cb/dir/o")).await.body, "moved");

    let reply = call(&n.app, put("/v1/files/from_id/t1/to_id/t3/cb/o", "x", None)).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    let reply = call(&n.app, put("/v1/files/from_id/t1/cb/o", "x", None)).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bucket_listing() {
    let n = node("t1");
    call(&n.app, put_json("/v1/daemon/synclb", &lbmap(1, &["lb"]))).await;
    for (name, data) in [("b", "22"), ("a", "1"), ("c/d", "333")] {
        call(&n.app, put(&format!("/v1/files/lb/{name}"), data, None)).await;
    }

    let reply = call(
        &n.app,
        get_json(
            "/v1/files/lb",
            json!({"props": "size, checksum, atime", "sort": "ascending, name", "time_format": "RFC3339"}),
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    let entries = reply.json()["entries"].as_array().unwrap().clone();
    let names: Vec<_> = entries.iter().map(|e| e["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["a", "b", "c/d"]);
    assert_eq!(entries[2]["size"], 3);
    assert_eq!(entries[2]["checksum"], hex(b"333"));
    assert!(entries[0]["atime"].as_str().unwrap().ends_with('Z'));

    // No body: names only
    let reply = call(&n.app, get("/v1/files/lb")).await;
    assert_eq!(reply.json()["entries"][0]["size"], 0);

    let reply = call(&n.app, get_json("/v1/files/lb", json!({"time_format": "Kitchen"}))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn daemon_queries() {
    let n = node("t1");
    call(&n.app, put("/v1/files/cb/o", "12345", None)).await;

    let reply = call(&n.app, get_json("/v1/daemon", json!({"what": "config"}))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["storage"]["no_xattrs"], true);

    let reply = call(&n.app, get_json("/v1/daemon", json!({"what": "smap"}))).await;
    assert_eq!(reply.json()["daemon_id"], "t1");
    assert_eq!(reply.json()["smap_version"], 0);

    let reply = call(&n.app, get_json("/v1/daemon", json!({"what": "stats"}))).await;
    let stats = reply.json();
    assert_eq!(stats["numput"], 1);
    let mountpaths = stats["mountpaths"].as_array().unwrap();
    assert_eq!(mountpaths.len(), 3);
    let used: u64 = mountpaths.iter().map(|m| m["used"].as_u64().unwrap()).sum();
    assert_eq!(used, 5);
    assert_eq!(stats["locks_held"], 0);
    assert!(stats["xactions"].as_array().unwrap().is_empty());

    let reply = call(&n.app, get_json("/v1/daemon", json!({"what": "everything"}))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert!(n.target.stats().snapshot().numerr >= 1);
}

#[tokio::test]
async fn daemon_actions() {
    let n = node("t1");
    let action = |action: &str, name: &str, value: &str| ActionMsg {
        action: action.to_string(),
        name: name.to_string(),
        value: value.to_string(),
    };

    let reply = call(&n.app, put_json("/v1/daemon", &action("lru", "", ""))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    let reply = call(
        &n.app,
        put_json("/v1/daemon", &action("setconfig", "lock_timeout_ms", "250")),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(n.target.config().lock.timeout_ms, 250);

    let reply = call(
        &n.app,
        put_json("/v1/daemon", &action("setconfig", "no_xattrs", "false")),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    let reply = call(
        &n.app,
        put_json("/v1/daemon", &action("setconfig", "log_level", "debug")),
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    let reply = call(&n.app, put_json("/v1/daemon", &action("reboot", "", ""))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    let reply = call(&n.app, put_json("/v1/daemon", &action("shutdown", "", ""))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(n.target.shutdown_token().is_cancelled());
}

#[tokio::test]
async fn shutdown_releases_blocked_requests() {
    let n = node_with("t1", "http://127.0.0.1:1", |config| {
        config.lock.timeout_ms = 30_000;
    });
    call(&n.app, put("/v1/files/cb/o", "v1", None)).await;
    let held = n.app.clone().oneshot(get("/v1/files/cb/o")).await.unwrap();

    let app = n.app.clone();
    let blocked = tokio::spawn(async move { call(&app, delete("/v1/files/cb/o")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!n.target.stop());

    let reply = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    drop(held);
}
