//! Root of the `atelier-core` library.
//!
//! This crate holds the sandbox-and-session machinery that sits between the
//! HTTP surface and the external model + sandbox providers: the local
//! process executor, the per-user sandbox manager, the file backend
//! abstraction with its write-through cache, and the agent event pipeline.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod backend;
pub mod error;
pub mod exec;
pub mod flags;
pub mod sandbox;
pub mod util;

pub use error::CoreErr;
pub use error::Result;
