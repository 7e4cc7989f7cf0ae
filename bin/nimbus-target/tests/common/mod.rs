//! Shared fixtures for target scenario tests

#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use nimbus_cloud::MemoryCloud;
use nimbus_common::config::TestFspathsConfig;
use nimbus_common::{Config, DaemonInfo, LocalBucketMap, Smap};
use nimbus_target::{Target, router};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// One target on synthetic mount paths with an in-memory cloud
pub struct Node {
    pub dir: TempDir,
    pub target: Arc<Target>,
    pub cloud: Arc<MemoryCloud>,
    pub app: Router,
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.no_xattrs = true;
    config.storage.test_fspaths = TestFspathsConfig {
        root: dir.path().to_path_buf(),
        count: 3,
        instance: 0,
    };
    config
}

pub fn node(id: &str) -> Node {
    node_with(id, "http://127.0.0.1:1", |_| {})
}

pub fn node_with(id: &str, direct_url: &str, tune: impl FnOnce(&mut Config)) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    tune(&mut config);
    let cloud = Arc::new(MemoryCloud::new());
    let daemon = DaemonInfo {
        daemon_id: id.to_string(),
        direct_url: direct_url.to_string(),
    };
    let target = Target::new(config, daemon, cloud.clone()).unwrap();
    let app = router(Arc::clone(&target));
    Node {
        dir,
        target,
        cloud,
        app,
    }
}

/// Response with its body fully read
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn checksum(&self) -> Option<&str> {
        self.headers
            .get("Content-HASH")
            .map(|v| v.to_str().unwrap())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

pub async fn call(app: &Router, request: Request<Body>) -> Reply {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    Reply {
        status,
        headers,
        body,
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_json(uri: &str, msg: serde_json::Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(msg.to_string()))
        .unwrap()
}

pub fn put(uri: &str, data: impl Into<Body>, checksum: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("PUT").uri(uri);
    if let Some(checksum) = checksum {
        builder = builder.header("Content-HASH", checksum);
    }
    builder.body(data.into()).unwrap()
}

pub fn put_json(uri: &str, msg: &impl serde::Serialize) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(msg).unwrap()))
        .unwrap()
}

pub fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn smap(version: u64, targets: &[(&str, &str)]) -> Smap {
    Smap {
        version,
        targets: targets
            .iter()
            .map(|(id, url)| {
                (
                    (*id).to_string(),
                    DaemonInfo {
                        daemon_id: (*id).to_string(),
                        direct_url: (*url).to_string(),
                    },
                )
            })
            .collect(),
    }
}

pub fn lbmap(version: u64, buckets: &[&str]) -> LocalBucketMap {
    LocalBucketMap {
        version,
        buckets: buckets.iter().map(ToString::to_string).collect(),
    }
}
