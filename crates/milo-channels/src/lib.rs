//! # Milo Channels
//! Transport sessions used by the bulk dispatcher.

pub mod smtp;

pub use smtp::{SmtpSession, SmtpSessionFactory};
