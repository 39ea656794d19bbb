use std::collections::BTreeMap;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use shared::{FieldChange, InventoryEntry, MacAddr};
use crate::error::StoreError;
use crate::inventory::db::InventoryDb;
use crate::inventory::query::SortKey;

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Commands sent to the inventory thread
pub enum InventoryCommand {
    TableExists(Reply<bool>),
    #[cfg(test)]
    EnsureTable(Reply<()>),
    Recreate(Reply<()>),
    GetAll(Reply<BTreeMap<MacAddr, InventoryEntry>>),
    #[cfg(test)]
    Get(MacAddr, Reply<Option<InventoryEntry>>),
    Insert(InventoryEntry, Reply<()>),
    UpdateField(MacAddr, FieldChange, Reply<()>),
    SetNote(MacAddr, String, Reply<()>),
    SetVendor(MacAddr, String, Reply<()>),
    Delete(MacAddr, Reply<InventoryEntry>),
    Find {
        search: String,
        sort: SortKey,
        reply: Reply<Vec<InventoryEntry>>,
    },
    WithVendor(String, Reply<Vec<InventoryEntry>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the thread that owns the inventory connection
#[derive(Clone)]
pub struct InventoryHandle {
    tx: mpsc::Sender<InventoryCommand>,
}

impl InventoryHandle {
    /// Spawn the inventory thread; it owns `db` until shutdown
    pub fn spawn(db: InventoryDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<InventoryCommand>(256);

        thread::spawn(move || {
            let mut shutdown_ack = None;

            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    InventoryCommand::TableExists(reply) => {
                        let _ = reply.send(db.table_exists());
                    }
                    #[cfg(test)]
                    InventoryCommand::EnsureTable(reply) => {
                        let _ = reply.send(db.ensure_table());
                    }
                    InventoryCommand::Recreate(reply) => {
                        let _ = reply.send(db.recreate());
                    }
                    InventoryCommand::GetAll(reply) => {
                        let _ = reply.send(db.get_all());
                    }
                    #[cfg(test)]
                    InventoryCommand::Get(mac, reply) => {
                        let _ = reply.send(db.get(&mac));
                    }
                    InventoryCommand::Insert(entry, reply) => {
                        let _ = reply.send(db.insert(&entry));
                    }
                    InventoryCommand::UpdateField(mac, change, reply) => {
                        let _ = reply.send(db.update_field(&mac, &change));
                    }
                    InventoryCommand::SetNote(mac, notes, reply) => {
                        let _ = reply.send(db.set_note(&mac, &notes));
                    }
                    InventoryCommand::SetVendor(mac, vendor, reply) => {
                        let _ = reply.send(db.set_vendor(&mac, &vendor));
                    }
                    InventoryCommand::Delete(mac, reply) => {
                        let _ = reply.send(db.delete(&mac));
                    }
                    InventoryCommand::Find { search, sort, reply } => {
                        let _ = reply.send(db.find(&search, sort));
                    }
                    InventoryCommand::WithVendor(vendor, reply) => {
                        let _ = reply.send(db.entries_with_vendor(&vendor));
                    }
                    InventoryCommand::Shutdown(ack) => {
                        tracing::debug!("Inventory thread shutting down");
                        shutdown_ack = Some(ack);
                        break;
                    }
                }
            }

            // Close the channel and the connection before acknowledging
            drop(rx);
            drop(db);
            if let Some(ack) = shutdown_ack {
                let _ = ack.send(());
            }
        });

        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> InventoryCommand,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| StoreError::Disconnected)?;
        rx.await.map_err(|_| StoreError::Disconnected)?
    }

    pub async fn table_exists(&self) -> Result<bool, StoreError> {
        self.request(InventoryCommand::TableExists).await
    }

    #[cfg(test)]
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        self.request(InventoryCommand::EnsureTable).await
    }

    pub async fn recreate(&self) -> Result<(), StoreError> {
        self.request(InventoryCommand::Recreate).await
    }

    pub async fn get_all(&self) -> Result<BTreeMap<MacAddr, InventoryEntry>, StoreError> {
        self.request(InventoryCommand::GetAll).await
    }

    #[cfg(test)]
    pub async fn get(&self, mac: MacAddr) -> Result<Option<InventoryEntry>, StoreError> {
        self.request(|reply| InventoryCommand::Get(mac, reply)).await
    }

    pub async fn insert(&self, entry: InventoryEntry) -> Result<(), StoreError> {
        self.request(|reply| InventoryCommand::Insert(entry, reply)).await
    }

    pub async fn update_field(&self, mac: MacAddr, change: FieldChange) -> Result<(), StoreError> {
        self.request(|reply| InventoryCommand::UpdateField(mac, change, reply))
            .await
    }

    pub async fn set_note(&self, mac: MacAddr, notes: String) -> Result<(), StoreError> {
        self.request(|reply| InventoryCommand::SetNote(mac, notes, reply)).await
    }

    pub async fn set_vendor(&self, mac: MacAddr, vendor: String) -> Result<(), StoreError> {
        self.request(|reply| InventoryCommand::SetVendor(mac, vendor, reply))
            .await
    }

    pub async fn delete(&self, mac: MacAddr) -> Result<InventoryEntry, StoreError> {
        self.request(|reply| InventoryCommand::Delete(mac, reply)).await
    }

    pub async fn find(&self, search: String, sort: SortKey) -> Result<Vec<InventoryEntry>, StoreError> {
        self.request(|reply| InventoryCommand::Find { search, sort, reply })
            .await
    }

    pub async fn entries_with_vendor(&self, vendor: String) -> Result<Vec<InventoryEntry>, StoreError> {
        self.request(|reply| InventoryCommand::WithVendor(vendor, reply))
            .await
    }

    /// Stop the thread and wait until the connection is closed
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(InventoryCommand::Shutdown(ack))
            .await
            .map_err(|_| StoreError::Disconnected)?;
        rx.await.map_err(|_| StoreError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry(mac: &str) -> InventoryEntry {
        InventoryEntry {
            mac: mac.parse().unwrap(),
            hostname: "host".to_string(),
            ip: "10.0.0.2".to_string(),
            lease_expiry: 0,
            vendor: "Acme".to_string(),
            first_seen: 1,
            notes: String::new(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_thread() {
        let handle = InventoryHandle::spawn(InventoryDb::open_in_memory("clients").unwrap());
        assert!(!handle.table_exists().await.unwrap());
        handle.ensure_table().await.unwrap();

        let entry = test_entry("aa:bb:cc:00:01:02");
        handle.insert(entry.clone()).await.unwrap();
        handle
            .set_note(entry.mac, "hallway".to_string())
            .await
            .unwrap();

        let stored = handle.get(entry.mac).await.unwrap().unwrap();
        assert_eq!(stored.notes, "hallway");

        let err = handle.insert(entry.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));

        let found = handle.find("hall".to_string(), SortKey::Hostname).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let handle = InventoryHandle::spawn(InventoryDb::open_in_memory("clients").unwrap());
        handle.shutdown().await.unwrap();

        assert!(matches!(handle.get_all().await, Err(StoreError::Disconnected)));
    }
}
