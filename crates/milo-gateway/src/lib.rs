//! # Milo Gateway
//! Thin HTTP surface over report dispatch: manual trigger, schedule
//! read/save, recipient management, and run history.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
