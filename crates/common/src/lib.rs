//! Common types for the presence onliner

mod credential;
mod error;

pub use credential::Credential;
pub use error::{Error, Result};
