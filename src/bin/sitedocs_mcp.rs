//! MCP server entrypoint (stdio transport).
//!
//! Exposes the pipeline tools over stdio for editor and agent integrations. Logs go to the log
//! file only, since stdout carries the protocol stream.
use anyhow::{Context, Result};
use rmcp::{service::ServiceExt, transport::stdio};
use sitedocs::{
    config,
    logging::{self, LogTarget},
    mcp::SitedocsMcpServer,
    runtime::Runtime,
};

#[tokio::main]
async fn main() -> Result<()> {
    config::init_config();
    logging::init_tracing_with(LogTarget::FileOnly);

    let runtime = Runtime::build(config::get_config())
        .await
        .context("failed to build runtime")?;
    let server = SitedocsMcpServer::new(runtime.dispatcher, runtime.metrics);

    let service = server
        .serve(stdio())
        .await
        .context("failed to start MCP server over stdio")?;

    service
        .waiting()
        .await
        .context("MCP server terminated unexpectedly")?;

    Ok(())
}
