use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;
use shared::protocol::VENDOR_NOT_FOUND;
use shared::MacAddr;
use crate::config::VendorConfig;
use crate::error::LookupError;

/// Resolves a MAC's OUI prefix to a vendor name. Best effort: failures
/// come back as `VENDOR_NOT_FOUND`.
pub trait VendorLookup {
    fn lookup_vendor(&self, mac: &MacAddr) -> impl Future<Output = String> + Send;
}

/// Serializes calls so successive lookups start at least `spacing` apart.
/// Waiters queue on the gate instead of failing.
pub struct RateGate {
    next_allowed: Mutex<Option<Instant>>,
    spacing: StdMutex<Duration>,
}

impl RateGate {
    pub fn new(spacing: Duration) -> Self {
        Self {
            next_allowed: Mutex::new(None),
            spacing: StdMutex::new(spacing),
        }
    }

    pub fn spacing(&self) -> Duration {
        *self.spacing.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_spacing(&self, spacing: Duration) {
        *self.spacing.lock().unwrap_or_else(|e| e.into_inner()) = spacing;
    }

    /// Wait for the gate to open, then claim the current slot.
    pub async fn wait(&self) {
        let mut next = self.next_allowed.lock().await;
        if let Some(at) = *next {
            tokio::time::sleep_until(at).await;
        }
        *next = Some(Instant::now() + self.spacing());
    }
}

/// Client for a macvendors-style API: `GET {base}/{oui}` answers 200 with
/// the vendor name as plain text.
pub struct MacVendorsClient {
    client: Client,
    base_url: String,
    gate: Arc<RateGate>,
}

impl MacVendorsClient {
    pub fn new(config: &VendorConfig, gate: Arc<RateGate>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            gate,
        })
    }

    async fn try_lookup(&self, mac: &MacAddr) -> Result<String, LookupError> {
        self.gate.wait().await;

        let url = format!("{}/{}", self.base_url, mac.oui_prefix());
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(LookupError::Status(response.status()));
        }

        let vendor = response.text().await?.trim().to_string();
        if vendor.is_empty() {
            return Ok(VENDOR_NOT_FOUND.to_string());
        }
        Ok(vendor)
    }
}

impl VendorLookup for MacVendorsClient {
    async fn lookup_vendor(&self, mac: &MacAddr) -> String {
        match self.try_lookup(mac).await {
            Ok(vendor) => vendor,
            Err(e) => {
                tracing::warn!("Vendor lookup for {} failed: {}", mac.oui_prefix(), e);
                VENDOR_NOT_FOUND.to_string()
            }
        }
    }
}
