//! Client-state reconciliation.
//!
//! Diffs a fresh DHCP snapshot against the stored inventory: unknown MACs
//! are enriched and inserted, known MACs get per-field updates, and MACs
//! missing from the snapshot are left alone. A client that drops off the
//! server's table is indistinguishable from one that was pruned early, so
//! nothing is ever evicted here; removal is an operator action.

use chrono::Utc;
use shared::protocol::VENDOR_NOT_FOUND;
use shared::{ChangeEvent, FieldChange, InventoryEntry};
use crate::error::{ReconcileError, StoreError};
use crate::inventory::InventoryHandle;
use crate::source::ClientSource;
use crate::vendor::VendorLookup;

/// Bundle of everything one reconciliation touches
pub struct Reconciler<S, V> {
    source: S,
    vendors: V,
    store: InventoryHandle,
}

impl<S: ClientSource, V: VendorLookup> Reconciler<S, V> {
    pub fn new(source: S, vendors: V, store: InventoryHandle) -> Self {
        Self { source, vendors, store }
    }

    pub fn store(&self) -> &InventoryHandle {
        &self.store
    }

    /// Swap in a source and lookup built from a reloaded config
    pub fn replace_backends(&mut self, source: S, vendors: V) {
        self.source = source;
        self.vendors = vendors;
    }

    /// One reconciliation cycle. If the snapshot can't be fetched the store
    /// is not touched and `SourceUnavailable` is returned.
    pub async fn reconcile(&self) -> Result<Vec<ChangeEvent>, ReconcileError> {
        let snapshot = self.source.fetch_clients().await?;
        let current = self.store.get_all().await?;

        let mut events = Vec::new();
        for (mac, record) in snapshot {
            match current.get(&mac) {
                None => {
                    let vendor = self.vendors.lookup_vendor(&mac).await;
                    let entry = InventoryEntry::new(record.clone(), vendor.clone(), Utc::now().timestamp());
                    self.store.insert(entry).await?;
                    tracing::info!(
                        "New client {} / {} at {} ({})",
                        mac,
                        record.hostname,
                        record.ip,
                        vendor
                    );
                    events.push(ChangeEvent::NewClient { mac, record, vendor });
                }
                Some(stored) => {
                    for change in FieldChange::diff(stored, &record) {
                        self.store.update_field(mac, change.clone()).await?;
                        tracing::info!(
                            "{} / {:<20} New {}: {}",
                            mac,
                            stored.hostname,
                            change.field(),
                            change.new_value_display()
                        );
                        events.push(ChangeEvent::FieldChanged {
                            mac,
                            hostname: stored.hostname.clone(),
                            change,
                        });
                    }
                }
            }
        }

        Ok(events)
    }

    /// Create the client table if it is missing, or rebuild it when `force`
    /// is set, and populate it from a fresh snapshot with every vendor looked
    /// up. The snapshot is fetched before anything is dropped. Returns the
    /// inserted entries, or `None` when an existing table was left as is.
    pub async fn bootstrap(&self, force: bool) -> Result<Option<Vec<InventoryEntry>>, ReconcileError> {
        let exists = self.store.table_exists().await?;
        if exists && !force {
            return Ok(None);
        }
        if !exists {
            tracing::warn!("Inventory table not found; creating it");
        }

        let snapshot = self.source.fetch_clients().await?;
        self.store.recreate().await?;
        if exists {
            tracing::warn!("Dropped the existing inventory table");
        }

        let mut inserted = Vec::with_capacity(snapshot.len());
        for (mac, record) in snapshot {
            let vendor = self.vendors.lookup_vendor(&mac).await;
            let entry = InventoryEntry::new(record, vendor, Utc::now().timestamp());
            self.store.insert(entry.clone()).await?;
            tracing::info!(
                "  {:<25}  {:<15}  {}   {}",
                entry.hostname,
                entry.ip,
                mac,
                entry.vendor
            );
            inserted.push(entry);
        }

        tracing::info!("Inventory table created with {} clients", inserted.len());
        Ok(Some(inserted))
    }

    /// Retry the lookup for entries whose vendor is the not-found sentinel.
    /// Operator-triggered only; reconciliation never re-enriches.
    pub async fn refresh_missing_vendors(&self) -> Result<Vec<InventoryEntry>, StoreError> {
        let missing = self
            .store
            .entries_with_vendor(VENDOR_NOT_FOUND.to_string())
            .await?;

        let mut updated = Vec::new();
        for mut entry in missing {
            let vendor = self.vendors.lookup_vendor(&entry.mac).await;
            if vendor == VENDOR_NOT_FOUND {
                continue;
            }
            self.store.set_vendor(entry.mac, vendor.clone()).await?;
            tracing::info!("Vendor for {} is now {}", entry.mac, vendor);
            entry.vendor = vendor;
            updated.push(entry);
        }
        Ok(updated)
    }
}
