//! Peer-to-peer object transfer
//!
//! A transfer names its source and destination targets explicitly:
//! `PUT /v1/files/from_id/{src}/to_id/{dst}/{bucket}/{object}`. The source
//! streams the file with its checksum; the destination stages, verifies
//! and commits it, or does nothing when it already holds a valid copy.

use crate::object::PutOutcome;
use crate::stats::TargetStats;
use crate::target::Target;
use bytes::Bytes;
use futures::Stream;
use nimbus_common::{
    API_VERSION, CONTENT_HASH_HEADER, Checksum, DaemonInfo, Error, ObjectKey, PATH_FILES,
    PATH_FROM, PATH_TO, Result,
};
use reqwest::Url;
use reqwest::header::CONTENT_LENGTH;
use std::fmt::Display;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// What this target did with a transfer request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Sent,
    /// Source held no copy worth sending
    Skipped,
    Received(PutOutcome),
}

/// URL of the transfer endpoint of `dest` for `key`
pub fn transfer_url(source: &str, dest: &DaemonInfo, key: &ObjectKey) -> Result<Url> {
    let mut url = Url::parse(&dest.direct_url).map_err(|e| {
        Error::Transfer(format!(
            "target {} has invalid URL {:?}: {e}",
            dest.daemon_id, dest.direct_url
        ))
    })?;
    url.path_segments_mut()
        .map_err(|()| Error::Transfer(format!("target URL {} cannot be a base", dest.direct_url)))?
        .pop_if_empty()
        .extend([
            API_VERSION,
            PATH_FILES,
            PATH_FROM,
            source,
            PATH_TO,
            dest.daemon_id.as_str(),
            key.bucket(),
        ])
        .extend(key.object().split('/'));
    Ok(url)
}

impl Target {
    /// Dispatch a transfer addressed to this target as source or destination
    pub async fn transfer<S, E>(
        &self,
        from: &str,
        to: &str,
        key: &ObjectKey,
        checksum: Option<Checksum>,
        body: S,
    ) -> Result<TransferOutcome>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        if from == self.id() {
            let smap = self.smap();
            let dest = smap.get(to).ok_or_else(|| {
                Error::invalid_request(format!(
                    "unknown destination {to} in smap v{}",
                    smap.version
                ))
            })?;
            let is_local = self.is_local(key.bucket());
            if self.send_object(key, is_local, dest).await? {
                Ok(TransferOutcome::Sent)
            } else {
                Ok(TransferOutcome::Skipped)
            }
        } else if to == self.id() {
            let outcome = self.receive_object(key, checksum, body).await?;
            Ok(TransferOutcome::Received(outcome))
        } else {
            Err(Error::invalid_request(format!(
                "transfer {key} from {from} to {to} addressed to {}",
                self.id()
            )))
        }
    }

    /// Stream the local copy of `key` to `dest` under a shared name lock.
    ///
    /// Returns false without contacting `dest` when a cloud object has no
    /// valid copy here; its new owner fetches it from the cloud instead.
    /// A local object explicitly marked invalid is an error.
    pub async fn send_object(
        &self,
        key: &ObjectKey,
        is_local: bool,
        dest: &DaemonInfo,
    ) -> Result<bool> {
        let fqn = self.mounts.fqn(key, is_local);
        let _guard = self.lock_name(key, false, &fqn).await?;

        let checksum = match self.attrs.get(&fqn)? {
            Some(attrs) if attrs.valid => Some(attrs.checksum),
            Some(_) if is_local => return Err(Error::InvalidObject(fqn.display().to_string())),
            None if is_local => None,
            Some(_) | None => {
                debug!("Not sending {key}: no valid copy");
                return Ok(false);
            }
        };
        let file = tokio::fs::File::open(&fqn)
            .await
            .map_err(|e| Error::from_io(e, &fqn))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::from_io(e, &fqn))?
            .len();

        let url = transfer_url(self.id(), dest, key)?;
        let mut request = self
            .client
            .put(url.clone())
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if let Some(checksum) = checksum {
            request = request.header(CONTENT_HASH_HEADER, checksum.to_hex());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("PUT {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Transfer(format!(
                "{key} to {}: {status}: {text}",
                dest.daemon_id
            )));
        }

        TargetStats::inc(&self.stats().numsendfile);
        TargetStats::add(&self.stats().bytes_sent, size);
        debug!("Sent {key} ({size} bytes) to {}", dest.daemon_id);
        Ok(true)
    }

    /// Accept a transferred object.
    ///
    /// Any valid copy already here wins, whatever its checksum: a delayed
    /// transfer must not replace newer content.
    pub async fn receive_object<S, E>(
        &self,
        key: &ObjectKey,
        checksum: Option<Checksum>,
        body: S,
    ) -> Result<PutOutcome>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let (fqn, _) = self.fqn(key);
        if let Some(existing) = self.has_valid_copy(key, &fqn, None).await? {
            debug!("Transfer of {key}: valid copy already present");
            return Ok(PutOutcome::Unchanged(existing));
        }

        let staged = self.stage(key, checksum, body).await?;
        let size = staged.size();
        let checksum = self.commit_staged(key, &fqn, staged).await?;

        TargetStats::inc(&self.stats().numrecvfile);
        TargetStats::add(&self.stats().bytes_received, size);
        info!("Received {key} ({size} bytes)");
        Ok(PutOutcome::Stored(checksum))
    }
}
