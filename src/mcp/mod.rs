//! Model Context Protocol (MCP) surface of the document pipeline.
//!
//! The server lists the dispatcher's tools with input schemas generated from their parameter
//! declarations and forwards every `call_tool` to [`crate::tools::Dispatcher::execute`], returning
//! the result envelope as structured content. Two read-only resources are published:
//! `sitedocs://document-types` and `sitedocs://metrics`.

mod format;
mod schemas;
mod server;

pub use server::SitedocsMcpServer;
