//! # Milo Core
//! Error taxonomy, configuration, domain types, and the collaborator traits
//! shared by the dispatch engine, the SMTP transport, and the HTTP gateway.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::MiloConfig;
pub use error::{MiloError, Result};
