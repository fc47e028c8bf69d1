//! The agent event pipeline: a streaming model client, the tool belt bound
//! to one sandbox, and the turn driver that projects the model/tool loop
//! onto the public [`atelier_protocol::TurnEvent`] alphabet.

pub mod client;
pub mod models;
pub mod pipeline;
pub mod tool_defs;

pub use client::ModelClient;
pub use client::Prompt;
pub use client::ResponseEvent;
pub use pipeline::TurnRequest;
pub use pipeline::run_turn;
