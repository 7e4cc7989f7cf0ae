//! Bucket listing
//!
//! Local buckets are listed by walking their directories on every mount
//! path; cloud buckets are listed by the backend and annotated with local
//! cache presence. Only the properties named in [`GetMsg::props`] are
//! filled in.

use crate::stats::TargetStats;
use crate::target::Target;
use chrono::{DateTime, SecondsFormat, Utc};
use nimbus_common::{
    BucketEntry, BucketList, Error, GetMsg, ObjectKey, Result, get_props, validate_bucket,
};
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Timestamp rendering selected by [`GetMsg::time_format`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeFormat {
    #[default]
    Rfc822,
    Rfc822Z,
    Rfc1123,
    Rfc1123Z,
    Rfc3339,
    Stamp,
    StampMilli,
}

impl TimeFormat {
    #[must_use]
    pub fn format(self, time: DateTime<Utc>) -> String {
        match self {
            Self::Rfc822 => time.format("%d %b %y %H:%M UTC").to_string(),
            Self::Rfc822Z => time.format("%d %b %y %H:%M %z").to_string(),
            Self::Rfc1123 => time.format("%a, %d %b %Y %H:%M:%S UTC").to_string(),
            Self::Rfc1123Z => time.format("%a, %d %b %Y %H:%M:%S %z").to_string(),
            Self::Rfc3339 => time.to_rfc3339_opts(SecondsFormat::Secs, true),
            Self::Stamp => time.format("%b %e %H:%M:%S").to_string(),
            Self::StampMilli => time.format("%b %e %H:%M:%S%.3f").to_string(),
        }
    }
}

impl FromStr for TimeFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "RFC822" => Ok(Self::Rfc822),
            "RFC822Z" => Ok(Self::Rfc822Z),
            "RFC1123" => Ok(Self::Rfc1123),
            "RFC1123Z" => Ok(Self::Rfc1123Z),
            "RFC3339" => Ok(Self::Rfc3339),
            "Stamp" => Ok(Self::Stamp),
            "StampMilli" => Ok(Self::StampMilli),
            other => Err(Error::invalid_request(format!("unknown time format {other:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum SortField {
    #[default]
    Name,
    Size,
    Ctime,
    Atime,
}

/// Parsed `"ascending|descending[, field]"`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SortOrder {
    descending: bool,
    field: SortField,
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut order = Self::default();
        let mut parts = s.split(',').map(str::trim).filter(|p| !p.is_empty());
        if let Some(direction) = parts.next() {
            order.descending = match direction.to_ascii_lowercase().as_str() {
                "ascending" | "asc" => false,
                "descending" | "desc" => true,
                _ => return Err(Error::invalid_request(format!("invalid sort {s:?}"))),
            };
        }
        if let Some(field) = parts.next() {
            order.field = match field.to_ascii_lowercase().as_str() {
                "name" => SortField::Name,
                "size" => SortField::Size,
                "ctime" => SortField::Ctime,
                "atime" => SortField::Atime,
                _ => return Err(Error::invalid_request(format!("invalid sort field {field:?}"))),
            };
        }
        Ok(order)
    }
}

/// Listing entry with raw times, rendered after sorting
struct Row {
    name: String,
    size: u64,
    ctime: Option<DateTime<Utc>>,
    atime: Option<DateTime<Utc>>,
    checksum: String,
    iscached: bool,
}

impl Row {
    fn compare(&self, other: &Self, field: SortField) -> Ordering {
        match field {
            SortField::Name => self.name.cmp(&other.name),
            SortField::Size => self.size.cmp(&other.size),
            SortField::Ctime => self.ctime.cmp(&other.ctime),
            SortField::Atime => self.atime.cmp(&other.atime),
        }
        .then_with(|| self.name.cmp(&other.name))
    }
}

fn utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

impl Target {
    /// List `bucket` according to `msg`
    pub async fn list_bucket(&self, bucket: &str, msg: &GetMsg) -> Result<BucketList> {
        validate_bucket(bucket)?;
        let time_format: TimeFormat = msg.time_format.parse()?;
        let order: SortOrder = msg.sort.parse()?;
        let is_local = self.is_local(bucket);

        let mut rows = if is_local {
            self.list_local(bucket, msg).await?
        } else {
            self.list_cloud(bucket, msg).await?
        };

        rows.sort_by(|a, b| {
            let ord = a.compare(b, order.field);
            if order.descending { ord.reverse() } else { ord }
        });

        let kind = self.mounts.layout().namespace(is_local).to_string();
        let entries = rows
            .into_iter()
            .map(|row| BucketEntry {
                name: row.name,
                size: if msg.wants(get_props::SIZE) { row.size } else { 0 },
                ctime: row
                    .ctime
                    .filter(|_| msg.wants(get_props::CTIME))
                    .map(|t| time_format.format(t))
                    .unwrap_or_default(),
                atime: row
                    .atime
                    .filter(|_| msg.wants(get_props::ATIME))
                    .map(|t| time_format.format(t))
                    .unwrap_or_default(),
                checksum: row.checksum,
                kind: kind.clone(),
                bucket: if msg.wants(get_props::BUCKET) {
                    bucket.to_string()
                } else {
                    String::new()
                },
                iscached: msg.wants(get_props::IS_CACHED) && row.iscached,
            })
            .collect::<Vec<_>>();

        TargetStats::inc(&self.stats().numlist);
        debug!("Listed {bucket}: {} entries", entries.len());
        Ok(BucketList { entries })
    }

    async fn list_local(&self, bucket: &str, msg: &GetMsg) -> Result<Vec<Row>> {
        let mounts = Arc::clone(&self.mounts);
        let name = bucket.to_string();
        let walked = tokio::task::spawn_blocking(move || mounts.walk(true, Some(&name)))
            .await
            .map_err(|e| Error::internal(format!("listing walk: {e}")))?;

        let want_checksum = msg.wants(get_props::CHECKSUM);
        let mut rows = Vec::with_capacity(walked.len());
        for obj in walked {
            let checksum = if want_checksum {
                self.attrs
                    .get(&obj.fqn)?
                    .map(|a| a.checksum.to_hex())
                    .unwrap_or_default()
            } else {
                String::new()
            };
            rows.push(Row {
                name: obj.key.object().to_string(),
                size: obj.size,
                ctime: Some(utc(obj.ctime)),
                atime: Some(utc(obj.atime)),
                checksum,
                iscached: true,
            });
        }
        Ok(rows)
    }

    async fn list_cloud(&self, bucket: &str, msg: &GetMsg) -> Result<Vec<Row>> {
        let listed = self.cloud.list_bucket(bucket).await?;
        let want_local = msg.wants(get_props::IS_CACHED) || msg.wants(get_props::ATIME);

        let mut rows = Vec::with_capacity(listed.len());
        for entry in listed {
            let mut iscached = false;
            let mut atime = None;
            if want_local && let Ok(key) = ObjectKey::new(bucket, entry.name.as_str()) {
                let fqn = self.mounts.fqn(&key, false);
                if let Ok(meta) = tokio::fs::metadata(&fqn).await {
                    iscached = meta.is_file();
                    atime = meta.accessed().ok().map(utc);
                }
            }
            rows.push(Row {
                name: entry.name,
                size: entry.size,
                ctime: entry.last_modified,
                atime,
                checksum: if msg.wants(get_props::CHECKSUM) {
                    entry.etag
                } else {
                    String::new()
                },
                iscached,
            });
        }
        Ok(rows)
    }
}
