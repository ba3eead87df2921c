//! agentbridge core - data model, fingerprints, and error handling

pub mod error;
pub mod fingerprint;
pub mod types;

pub use error::{Error, Result};
pub use fingerprint::{fingerprint_bytes, fingerprint_content, fingerprint_value};
pub use types::*;
