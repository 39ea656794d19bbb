//! Data model shared by the monitor daemon and its tooling.

pub mod protocol;
pub mod types;

pub use types::{ChangeEvent, ClientField, ClientRecord, FieldChange, InventoryEntry, MacAddr};
