//! REST API of a storage target
//!
//! - `GET    /v1/files/{bucket}`            list a bucket (optional `GetMsg` body)
//! - `GET    /v1/files/{bucket}/{object}`   read an object
//! - `PUT    /v1/files/{bucket}/{object}`   store an object
//! - `DELETE /v1/files/{bucket}/{object}`   delete an object
//! - `PUT    /v1/files/from_id/{src}/to_id/{dst}/{bucket}/{object}` peer transfer
//! - `GET    /v1/daemon`                    config, smap or stats (`GetMsg` body)
//! - `PUT    /v1/daemon`                    `ActionMsg`
//! - `PUT    /v1/daemon/{syncsmap|rebalance|synclb}` map push

use crate::error::{ApiError, ApiResult};
use crate::stats::TargetStats;
use crate::target::Target;
use crate::transfer::TransferOutcome;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use nimbus_common::{
    ActionMsg, CONTENT_HASH_HEADER, Checksum, Error, GetMsg, LocalBucketMap, ObjectKey,
    PATH_FROM, PATH_TO, Smap, actions, get_what,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the target router
pub fn router(target: Arc<Target>) -> Router {
    Router::new()
        .route("/v1/files/{bucket}", get(list_bucket))
        .route(
            "/v1/files/{bucket}/{*object}",
            get(get_object).put(put_object).delete(delete_object),
        )
        .route("/v1/daemon", get(get_daemon).put(put_daemon))
        .route("/v1/daemon/{suffix}", put(push_map))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&target),
            count_errors,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(target)
}

/// Count every failed request
async fn count_errors(State(target): State<Arc<Target>>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        TargetStats::inc(&target.stats().numerr);
    }
    response
}

/// Decode an optional JSON body; empty means default
fn parse_msg<T: DeserializeOwned + Default>(body: &[u8]) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

/// Decode a required JSON body
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    if body.is_empty() {
        return Err(Error::invalid_request("missing request body").into());
    }
    Ok(serde_json::from_slice(body)?)
}

fn client_checksum(headers: &HeaderMap) -> ApiResult<Option<Checksum>> {
    let Some(value) = headers.get(CONTENT_HASH_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Some)
        .ok_or_else(|| {
            ApiError(Error::invalid_request(format!(
                "malformed {CONTENT_HASH_HEADER} header"
            )))
        })
}

fn checksum_reply(checksum: Checksum) -> Response {
    (StatusCode::OK, [(CONTENT_HASH_HEADER, checksum.to_hex())]).into_response()
}

async fn list_bucket(
    State(target): State<Arc<Target>>,
    Path(bucket): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let msg: GetMsg = parse_msg(&body)?;
    let list = target.list_bucket(&bucket, &msg).await?;
    Ok(Json(list).into_response())
}

async fn get_object(
    State(target): State<Arc<Target>>,
    Path((bucket, object)): Path<(String, String)>,
) -> ApiResult<Response> {
    let key = ObjectKey::new(bucket, object)?;
    let read = target.get_object(&key).await?;
    TargetStats::add(&target.stats().bytes_sent, read.size);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, read.size);
    if let Some(checksum) = read.checksum {
        builder = builder.header(CONTENT_HASH_HEADER, checksum.to_hex());
    }
    builder
        .body(Body::from_stream(read.body))
        .map_err(|e| ApiError(Error::internal(format!("response for {key}: {e}"))))
}

async fn put_object(
    State(target): State<Arc<Target>>,
    Path((bucket, object)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let checksum = client_checksum(&headers)?;
    if bucket == PATH_FROM {
        return transfer(&target, &object, checksum, body).await;
    }

    let key = ObjectKey::new(bucket, object)?;
    let outcome = target
        .put_object(&key, checksum, body.into_data_stream())
        .await?;
    Ok(checksum_reply(outcome.checksum()))
}

/// `{src}/to_id/{dst}/{bucket}/{object}` following `/v1/files/from_id/`
async fn transfer(
    target: &Target,
    path: &str,
    checksum: Option<Checksum>,
    body: Body,
) -> ApiResult<Response> {
    let mut parts = path.splitn(4, '/');
    let (Some(from), Some(PATH_TO), Some(to), Some(rest)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::invalid_request(format!("malformed transfer path {path:?}")).into());
    };
    let Some((bucket, object)) = rest.split_once('/') else {
        return Err(Error::invalid_request(format!("transfer path {path:?} names no object")).into());
    };
    let key = ObjectKey::new(bucket, object)?;

    match target
        .transfer(from, to, &key, checksum, body.into_data_stream())
        .await?
    {
        TransferOutcome::Sent | TransferOutcome::Skipped => Ok(StatusCode::OK.into_response()),
        TransferOutcome::Received(outcome) => Ok(checksum_reply(outcome.checksum())),
    }
}

async fn delete_object(
    State(target): State<Arc<Target>>,
    Path((bucket, object)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let key = ObjectKey::new(bucket, object)?;
    target.delete_object(&key).await?;
    Ok(StatusCode::OK)
}

async fn get_daemon(State(target): State<Arc<Target>>, body: Bytes) -> ApiResult<Response> {
    let msg: GetMsg = parse_msg(&body)?;
    match msg.what.as_str() {
        get_what::CONFIG => Ok(Json(&*target.config()).into_response()),
        get_what::SMAP => Ok(Json(target.daemon_snapshot()).into_response()),
        get_what::STATS => Ok(Json(target.stats_snapshot().await?).into_response()),
        other => Err(Error::invalid_request(format!("unexpected what {other:?}")).into()),
    }
}

async fn put_daemon(State(target): State<Arc<Target>>, body: Bytes) -> ApiResult<StatusCode> {
    let msg: ActionMsg = parse_body(&body)?;
    match msg.action.as_str() {
        actions::SET_CONFIG => target.update_config(&msg.name, &msg.value)?,
        actions::SHUTDOWN => {
            info!("Shutdown requested");
            target.shutdown_token().cancel();
        }
        actions::LRU => {
            if !target.config().lru.enabled {
                return Err(Error::invalid_request("LRU is disabled").into());
            }
            if target.start_lru().is_none() {
                info!("LRU already running");
            }
        }
        other => {
            return Err(Error::invalid_request(format!("unexpected action {other:?}")).into());
        }
    }
    Ok(StatusCode::OK)
}

async fn push_map(
    State(target): State<Arc<Target>>,
    Path(suffix): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    match suffix.as_str() {
        actions::SYNC_SMAP => {
            target.apply_smap(parse_body::<Smap>(&body)?)?;
        }
        actions::REBALANCE => {
            target.apply_smap_and_rebalance(parse_body::<Smap>(&body)?)?;
        }
        actions::SYNC_LB => {
            let lbmap: LocalBucketMap = parse_body(&body)?;
            let target = Arc::clone(&target);
            tokio::task::spawn_blocking(move || target.apply_lbmap(lbmap))
                .await
                .map_err(|e| Error::internal(format!("local bucket map update: {e}")))??;
        }
        other => {
            return Err(Error::invalid_request(format!("unexpected path suffix {other:?}")).into());
        }
    }
    Ok(StatusCode::OK)
}
