pub mod buffer;
pub mod config;
pub mod delivery;
pub mod dkim;
pub mod error;
pub mod header;
pub mod message;
pub mod modifier;
pub mod registry;
pub mod target;

pub use buffer::*;
pub use config::*;
pub use error::*;
pub use header::*;
pub use message::*;
pub use modifier::*;
pub use registry::*;
pub use target::*;
