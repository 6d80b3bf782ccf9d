//! The service-registration handshake with the kernel.
//!
//! Every access name is registered on startup so the kernel can route work
//! here. Registration is mandatory: an unregistered executor can never
//! receive work, so exhausting the retries is fatal for the process.
//! Unregistration on shutdown is best effort.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use url::Url;

pub const EXECUTOR_IFACE_VERSION: &str = "v1.0";

const REGISTER_TRIES: u32 = 5;
const REGISTER_BASE_DELAY: Duration = Duration::from_secs(1);

pub struct Registrar {
    client: reqwest::Client,
    kernel_url: Url,
    endpoint: String,
    access_codes: Vec<String>,
}

impl Registrar {
    pub fn new(kernel_url: &str, endpoint: String, access_codes: Vec<String>) -> Result<Self> {
        // Url::join drops the last path segment without a trailing slash.
        let normalized = if kernel_url.ends_with('/') {
            kernel_url.to_string()
        } else {
            format!("{}/", kernel_url)
        };
        Ok(Registrar {
            client: reqwest::Client::new(),
            kernel_url: Url::parse(&normalized).context("invalid kernel url")?,
            endpoint,
            access_codes,
        })
    }

    fn worker_url(&self, operation: &str) -> Result<Url> {
        self.kernel_url
            .join(&format!("{}/worker/{}", EXECUTOR_IFACE_VERSION, operation))
            .context("invalid worker url")
    }

    async fn post_worker(&self, operation: &str, name: &str) -> Result<()> {
        let response = self
            .client
            .post(self.worker_url(operation)?)
            .form(&[("name", name), ("endpoint", self.endpoint.as_str())])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() || body == "Failed" {
            return Err(anyhow!(
                "kernel refused to {} {:?}: status {}, body {:?}",
                operation,
                name,
                status,
                body
            ));
        }
        Ok(())
    }

    /// Register one name, retrying with exponential backoff and jitter.
    async fn register_with_retry(&self, name: &str) -> Result<()> {
        let mut delay = REGISTER_BASE_DELAY;
        for attempt in 1..=REGISTER_TRIES {
            match self.post_worker("register", name).await {
                Ok(()) => {
                    tracing::info!("registered with the kernel as {:?}", name);
                    return Ok(());
                }
                Err(e) if attempt == REGISTER_TRIES => return Err(e),
                Err(e) => {
                    let jitter = rand::thread_rng().gen_range(Duration::ZERO..Duration::from_secs(1));
                    tracing::warn!(
                        "registration attempt {}/{} for {:?} failed: {:#}",
                        attempt,
                        REGISTER_TRIES,
                        name,
                        e
                    );
                    tokio::time::sleep(delay + jitter).await;
                    delay *= 2;
                }
            }
        }
        unreachable!("retry loop returns on the last attempt")
    }

    pub async fn register_all(&self) -> Result<()> {
        for name in &self.access_codes {
            self.register_with_retry(name).await?;
        }
        Ok(())
    }

    /// Best-effort unregistration; failures are logged, never fatal.
    pub async fn unregister_all(&self) {
        for name in &self.access_codes {
            match self.post_worker("unregister", name).await {
                Ok(()) => tracing::info!("unregistered {:?} from the kernel", name),
                Err(e) => tracing::warn!("failed to unregister {:?}: {:#}", name, e),
            }
        }
    }
}
