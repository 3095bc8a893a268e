//! PostgreSQL Wire Protocol (Pure, Sync)
//!
//! No async, no I/O, no tokio - just messages ↔ bytes.

pub mod builder;
pub mod error;
pub mod types;
pub mod wire;

pub use builder::{Mark, RequestBuilder, Target, PROTOCOL_V3_0, PROTOCOL_V3_2};
pub use error::BuildError;
pub use types::{array_element_oid, oid};
pub use wire::*;
