//! Common utilities and types shared across the clone engine crates.

pub mod error;
pub mod hash;
pub mod resource_id;
pub mod timestamp;

pub use error::{Error, ErrorKind, Result};
pub use resource_id::{ids_match, ResourceId};
pub use timestamp::Timestamp;
