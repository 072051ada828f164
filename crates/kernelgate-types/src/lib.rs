//! Kernel, message, and result types for kernelgate.
//!
//! This crate is the protocol foundation: typed IDs, kernel specs, the
//! Jupyter message envelope and its JSON codec, and the aggregated
//! execution result. It has **no I/O** and no internal kernelgate
//! dependencies, so the client builds on it as a leaf crate.
//!
//! # Correlation
//!
//! ```text
//! execute_request (header.msg_id = M)
//!     ├── status busy        parent_header.msg_id = M
//!     ├── stream stdout      parent_header.msg_id = M   → ExecutionResult.stream
//!     ├── execute_result     parent_header.msg_id = M   → ExecutionResult.return_value
//!     ├── execute_reply      parent_header.msg_id = M   → ExecutionResult.execution_count
//!     └── status idle        parent_header.msg_id = M   ← terminal marker
//! ```
//!
//! # Key Types
//!
//! |---------------------|---------------------------------------------|
//! | Type                | Purpose                                     |
//! |---------------------|---------------------------------------------|
//! | [`KernelSpec`]      | What to launch (name + launch env)          |
//! | [`KernelIdentity`]  | Which kernel the gateway started            |
//! | [`ProtocolMessage`] | One envelope on the execution channel       |
//! | [`MsgId`]           | Message id; `parent_id` correlates replies  |
//! | [`SessionId`]       | Client channel session                      |
//! | [`ExecutionResult`] | Everything one execute request produced     |
//! |---------------------|---------------------------------------------|

pub mod codec;
pub mod ids;
pub mod kernel;
pub mod message;
pub mod result;

pub use codec::{decode, decode_bytes, encode, CodecError};
pub use ids::{KernelId, MsgId, SessionId};
pub use kernel::{KernelIdentity, KernelInfo, KernelSpec, KernelSpecInfo};
pub use message::{Channel, Header, MsgType, ProtocolMessage, PROTOCOL_VERSION};
pub use result::{ExecutionError, ExecutionResult, MimeBundle, StreamChunk, StreamName};
