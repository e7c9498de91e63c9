//! Common types for the DPoP resource client workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
