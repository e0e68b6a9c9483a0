//! Tool registry and dispatcher shared by the MCP and HTTP surfaces.
//!
//! Every externally triggered call goes through [`Dispatcher::execute`], which validates the
//! arguments against the tool's [`ToolSpec`], retries backend-class failures and always answers
//! with a [`ResultEnvelope`].

pub mod builtin;
mod dispatcher;
mod envelope;
mod registry;

pub use builtin::builtin_registry;
pub use dispatcher::Dispatcher;
pub use envelope::{EnvelopeStatus, ResultEnvelope};
pub use registry::{
    ParamKind, ParamSpec, ToolError, ToolHandler, ToolOutput, ToolRegistry, ToolSpec,
};
