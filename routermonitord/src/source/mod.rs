//! DHCP server adapters.
//!
//! Each backend scrapes its server into typed lease rows, then normalizes
//! them into canonical `ClientRecord`s keyed by MAC.

pub mod ddwrt;
pub mod pfsense;

use std::collections::BTreeMap;
use std::future::Future;
use shared::{ClientRecord, MacAddr};
use crate::config::DhcpConfig;
use crate::error::SourceError;

pub use ddwrt::DdWrtSource;
pub use pfsense::PfsenseSource;

/// One poll of the DHCP server
pub type Snapshot = BTreeMap<MacAddr, ClientRecord>;

pub trait ClientSource {
    /// Fetch the current client list. An error means "no snapshot", never
    /// "no clients".
    fn fetch_clients(&self) -> impl Future<Output = Result<Snapshot, SourceError>> + Send;
}

/// The configured backend
pub enum DhcpSource {
    Pfsense(PfsenseSource),
    DdWrt(DdWrtSource),
}

impl DhcpSource {
    pub fn from_config(config: &DhcpConfig) -> Result<Self, SourceError> {
        match config {
            DhcpConfig::Pfsense(pf) => Ok(DhcpSource::Pfsense(PfsenseSource::new(pf.clone())?)),
            DhcpConfig::DdWrt(dd) => Ok(DhcpSource::DdWrt(DdWrtSource::new(dd.clone()))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DhcpSource::Pfsense(_) => "pfsense",
            DhcpSource::DdWrt(_) => "dd-wrt",
        }
    }
}

impl ClientSource for DhcpSource {
    async fn fetch_clients(&self) -> Result<Snapshot, SourceError> {
        let snapshot = match self {
            DhcpSource::Pfsense(source) => source.fetch_clients().await?,
            DhcpSource::DdWrt(source) => source.fetch_clients().await?,
        };
        tracing::debug!("Fetched {} clients from {}", snapshot.len(), self.kind());
        Ok(snapshot)
    }
}

/// Collect records into a snapshot; a repeated MAC keeps the last row
pub(crate) fn collect_snapshot(records: impl IntoIterator<Item = ClientRecord>) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for record in records {
        if let Some(previous) = snapshot.insert(record.mac, record) {
            tracing::warn!("Duplicate lease for {}; keeping the later row", previous.mac);
        }
    }
    snapshot
}
