//! HTTP cloud backend
//!
//! Two vendor dialects share one client:
//! - `aws`: S3 REST, path-style URLs, `ListObjectsV2` XML listings
//! - `gcp`: GCS JSON API, media downloads and uploads
//!
//! Requests carry an optional bearer token; request signing is left to a
//! fronting proxy.

use crate::backend::{ByteStream, CloudBackend, CloudEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use nimbus_common::config::{CloudConfig, CloudProvider};
use nimbus_common::{Error, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

const S3_ENDPOINT: &str = "https://s3.amazonaws.com";
const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Cloud backend over HTTP
pub struct HttpCloud {
    client: reqwest::Client,
    endpoint: Url,
    dialect: CloudProvider,
    bearer_token: Option<String>,
}

impl HttpCloud {
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let endpoint = if config.endpoint.is_empty() {
            match config.provider {
                CloudProvider::Aws => S3_ENDPOINT,
                CloudProvider::Gcp => GCS_ENDPOINT,
            }
        } else {
            config.endpoint.as_str()
        };
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::configuration(format!("cloud endpoint {endpoint:?}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::configuration(format!(
                "cloud endpoint {endpoint} is not a base URL"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::configuration(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            dialect: config.provider,
            bearer_token: config.bearer_token.clone(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Endpoint URL with `segments` appended, each percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| Error::configuration("cloud endpoint is not a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, bucket: &str, object: &str) -> Result<Url> {
        match self.dialect {
            CloudProvider::Aws => {
                let mut segments = vec![bucket];
                segments.extend(object.split('/'));
                self.url(&segments)
            }
            // The whole object name is one segment; '/' is encoded
            CloudProvider::Gcp => self.url(&["storage", "v1", "b", bucket, "o", object]),
        }
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.client.request(method, url);
        match &self.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, bucket: &str, object: &str) -> Result<Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::cloud(format!("{bucket}/{object}: {e}")))?;
        check_status(resp, bucket, object).await
    }

    async fn list_s3(&self, bucket: &str) -> Result<Vec<CloudEntry>> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut url = self.url(&[bucket])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("list-type", "2");
                if let Some(token) = &token {
                    query.append_pair("continuation-token", token);
                }
            }
            let resp = self.send(self.request(Method::GET, url), bucket, "").await?;
            let body = resp
                .text()
                .await
                .map_err(|e| Error::cloud(format!("list {bucket}: {e}")))?;
            let (page, next) = parse_s3_listing(&body)?;
            entries.extend(page);
            match next {
                Some(next) => token = Some(next),
                None => return Ok(entries),
            }
        }
    }

    async fn list_gcs(&self, bucket: &str) -> Result<Vec<CloudEntry>> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut url = self.url(&["storage", "v1", "b", bucket, "o"])?;
            if let Some(token) = &token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }
            let resp = self.send(self.request(Method::GET, url), bucket, "").await?;
            let body = resp
                .text()
                .await
                .map_err(|e| Error::cloud(format!("list {bucket}: {e}")))?;
            let (page, next) = parse_gcs_listing(&body)?;
            entries.extend(page);
            match next {
                Some(next) => token = Some(next),
                None => return Ok(entries),
            }
        }
    }
}

#[async_trait]
impl CloudBackend for HttpCloud {
    fn name(&self) -> &'static str {
        match self.dialect {
            CloudProvider::Aws => "aws",
            CloudProvider::Gcp => "gcp",
        }
    }

    async fn get_obj(&self, bucket: &str, object: &str) -> Result<ByteStream> {
        let mut url = self.object_url(bucket, object)?;
        if self.dialect == CloudProvider::Gcp {
            url.query_pairs_mut().append_pair("alt", "media");
        }
        debug!("GET {url}");
        let resp = self.send(self.request(Method::GET, url), bucket, object).await?;
        Ok(Box::pin(
            resp.bytes_stream().map(|r| r.map_err(std::io::Error::other)),
        ))
    }

    async fn put_obj(&self, bucket: &str, object: &str, path: &Path, size: u64) -> Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let (method, url) = match self.dialect {
            CloudProvider::Aws => (Method::PUT, self.object_url(bucket, object)?),
            CloudProvider::Gcp => {
                let mut url = self.url(&["upload", "storage", "v1", "b", bucket, "o"])?;
                url.query_pairs_mut()
                    .append_pair("uploadType", "media")
                    .append_pair("name", object);
                (Method::POST, url)
            }
        };
        debug!("{method} {url} ({size} bytes)");
        let req = self
            .request(method, url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body);
        self.send(req, bucket, object).await?;
        Ok(())
    }

    async fn delete_obj(&self, bucket: &str, object: &str) -> Result<()> {
        let url = self.object_url(bucket, object)?;
        debug!("DELETE {url}");
        self.send(self.request(Method::DELETE, url), bucket, object)
            .await?;
        Ok(())
    }

    async fn list_bucket(&self, bucket: &str) -> Result<Vec<CloudEntry>> {
        match self.dialect {
            CloudProvider::Aws => self.list_s3(bucket).await,
            CloudProvider::Gcp => self.list_gcs(bucket).await,
        }
    }
}

async fn check_status(resp: Response, bucket: &str, object: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::NOT_FOUND => Err(Error::ObjectNotFound {
            bucket: bucket.to_string(),
            object: object.to_string(),
        }),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            Err(Error::Forbidden(format!("{bucket}/{object}")))
        }
        _ => {
            let body = resp.text().await.unwrap_or_default();
            Err(Error::cloud(format!(
                "{bucket}/{object}: status {status}: {body}"
            )))
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListBucketResult {
    #[serde(rename = "IsTruncated")]
    is_truncated: bool,
    #[serde(rename = "NextContinuationToken")]
    next_continuation_token: Option<String>,
    #[serde(rename = "Contents")]
    contents: Vec<S3Object>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct S3Object {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "LastModified")]
    last_modified: String,
    #[serde(rename = "ETag")]
    etag: String,
}

/// One `ListObjectsV2` page and its continuation token
fn parse_s3_listing(xml: &str) -> Result<(Vec<CloudEntry>, Option<String>)> {
    let result: ListBucketResult = quick_xml::de::from_str(xml)
        .map_err(|e| Error::cloud(format!("malformed S3 listing: {e}")))?;
    let entries = result
        .contents
        .into_iter()
        .map(|o| CloudEntry {
            last_modified: parse_time(&o.last_modified),
            name: o.key,
            size: o.size,
            etag: o.etag.trim_matches('"').to_string(),
        })
        .collect();
    let next = result
        .next_continuation_token
        .filter(|_| result.is_truncated);
    Ok((entries, next))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GcsList {
    items: Vec<GcsObject>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GcsObject {
    name: String,
    /// Decimal string in the JSON API
    size: String,
    updated: String,
    md5_hash: String,
}

/// One GCS objects page and its page token
fn parse_gcs_listing(json: &str) -> Result<(Vec<CloudEntry>, Option<String>)> {
    let list: GcsList = serde_json::from_str(json)
        .map_err(|e| Error::cloud(format!("malformed GCS listing: {e}")))?;
    let entries = list
        .items
        .into_iter()
        .map(|o| CloudEntry {
            size: o.size.parse().unwrap_or(0),
            last_modified: parse_time(&o.updated),
            name: o.name,
            etag: o.md5_hash,
        })
        .collect();
    Ok((entries, list.next_page_token))
}
