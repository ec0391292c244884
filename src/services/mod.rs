pub mod receipts;

pub use receipts::{MemoryStore, ReceiptService};
