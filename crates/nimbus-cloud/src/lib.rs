//! Nimbus Cloud - authoritative object stores behind the cache
//!
//! Targets depend only on the [`CloudBackend`] trait. The vendor is picked
//! once at startup from the `[cloud]` configuration section:
//! - [`HttpCloud`] speaks either the S3 REST dialect or the GCS JSON API
//! - [`MemoryCloud`] keeps objects in memory and counts calls (tests)

pub mod backend;
pub mod http;
pub mod memory;

pub use backend::{ByteStream, CloudBackend, CloudEntry};
pub use http::HttpCloud;
pub use memory::MemoryCloud;

use nimbus_common::Result;
use nimbus_common::config::CloudConfig;
use std::sync::Arc;

/// Build the backend described by the configuration
pub fn from_config(config: &CloudConfig) -> Result<Arc<dyn CloudBackend>> {
    let backend = HttpCloud::new(config)?;
    tracing::info!(
        "Cloud backend: {} at {}",
        backend.name(),
        backend.endpoint()
    );
    Ok(Arc::new(backend))
}
