//! HTTP surface of the atelier backend: auth, the relational store, and
//! the session orchestrator that binds requests to agent turns.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;
pub mod store;

pub use error::ApiError;
pub use state::AppState;
pub use store::Store;
