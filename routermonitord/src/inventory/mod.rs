pub mod db;
pub mod handle;
pub mod query;

pub use db::InventoryDb;
pub use handle::InventoryHandle;
pub use query::SortKey;
