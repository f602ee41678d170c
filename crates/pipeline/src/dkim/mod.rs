//! DKIM message signing.

pub mod canon;
pub mod hash;
pub mod key;
pub mod modifier;
pub mod signer;

pub use canon::*;
pub use hash::*;
pub use key::*;
pub use modifier::*;
pub use signer::*;
