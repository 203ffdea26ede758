//! carevault-core: shared types, configuration schema, and error types
//!
//! Nothing in here touches key material; see `carevault-crypto` for the
//! primitives and `carevault-workspace` for the lock state machine.

pub mod config;
pub mod error;
pub mod types;

pub use error::{CarevaultError, CarevaultResult};
