//! Registration with the cluster coordinator

use crate::target::Target;
use nimbus_common::{API_VERSION, DaemonInfo, Error, PATH_CLUSTER, PATH_DAEMON, Result};
use std::time::Duration;
use tracing::{error, info, warn};

/// Delay before the single registration retry
pub const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Client for the coordinator's cluster endpoint
#[derive(Clone, Debug)]
pub struct Registrar {
    client: reqwest::Client,
    proxy_url: String,
    retry_delay: Duration,
}

impl Registrar {
    pub fn new(client: reqwest::Client, proxy_url: &str) -> Self {
        Self {
            client,
            proxy_url: proxy_url.trim_end_matches('/').to_string(),
            retry_delay: RETRY_DELAY,
        }
    }

    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// `POST {proxy}/v1/cluster`; a connection failure is retried once
    pub async fn register(&self, daemon: &DaemonInfo) -> Result<()> {
        let url = format!("{}/{API_VERSION}/{PATH_CLUSTER}", self.proxy_url);
        info!("Registering {} with {url}", daemon.daemon_id);

        let response = match self.client.post(&url).json(daemon).send().await {
            Err(e) if e.is_connect() => {
                warn!(
                    "Coordinator unreachable ({e}), retrying in {:?}",
                    self.retry_delay
                );
                tokio::time::sleep(self.retry_delay).await;
                self.client.post(&url).json(daemon).send().await
            }
            other => other,
        }
        .map_err(|e| Error::internal(format!("register with {url}: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::internal(format!(
                "register with {url}: {status}: {body}"
            )));
        }
        info!("Registered {} at {}", daemon.daemon_id, daemon.direct_url);
        Ok(())
    }

    /// `DELETE {proxy}/v1/cluster/daemon/{id}`
    pub async fn unregister(&self, daemon_id: &str) -> Result<()> {
        let url = format!(
            "{}/{API_VERSION}/{PATH_CLUSTER}/{PATH_DAEMON}/{daemon_id}",
            self.proxy_url
        );
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Error::internal(format!("unregister via {url}: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::internal(format!(
                "unregister via {url}: {status}: {body}"
            )));
        }
        info!("Unregistered {daemon_id}");
        Ok(())
    }
}

impl Target {
    /// Stop background work and leave the cluster.
    ///
    /// Runs before the listener closes so the coordinator stops routing
    /// here while in-flight requests drain. Returns true when an xaction
    /// was running.
    pub async fn leave(&self, registrar: Option<&Registrar>) -> bool {
        let was_running = self.stop();
        if let Some(registrar) = registrar
            && let Err(e) = registrar.unregister(self.id()).await
        {
            error!("Failed to unregister: {e}");
        }
        was_running
    }
}
