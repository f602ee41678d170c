//! Delivery of accepted messages to mailbox storage.

pub mod account;
pub mod backend;
pub mod memory;
pub mod storage;
pub mod transaction;

pub use account::*;
pub use backend::*;
pub use memory::*;
pub use storage::*;
pub use transaction::*;
