//! Control plane: the operator UI's remote channel into the agent.
//!
//! A length-prefixed binary protocol over TLS with HMAC challenge-response
//! authentication, request/response correlation, and event push. Control
//! sessions never touch session state directly; they enqueue commands into
//! the owning connection's inbox and observe the aggregated event stream.

mod frame;
mod handlers;
mod server;
mod types;

pub use frame::{Frame, FrameCodec, HEADER_LEN, MAGIC, MAX_PAYLOAD, VERSION};
pub use server::{ControlDeps, ControlServer};
pub use types::MessageType;
