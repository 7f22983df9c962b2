//! Per-project agent session plus the tool-call shim sitting between the
//! CLI's output stream and the MCP client.

pub mod catalog;
pub mod provider;
pub mod session;
pub mod shim;

pub use catalog::ToolCatalog;
pub use provider::JsonLinesAdapter;
pub use session::AgentSession;
pub use shim::ToolShim;

use crate::errors::{GatewayError, GatewayResult};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;

/// Shared handle over the CLI's stdin. One mutex serializes every write;
/// `None` means no process is attached.
pub type StdinWriter = Arc<Mutex<Option<ChildStdin>>>;

pub fn new_stdin_writer() -> StdinWriter {
    Arc::new(Mutex::new(None))
}

/// Writes one newline-terminated line to the agent stdin. Fails with
/// `NotRunning` when no process is attached.
pub async fn write_stdin_line(stdin: &StdinWriter, text: &str) -> GatewayResult<()> {
    let mut guard = stdin.lock().await;
    let Some(writer) = guard.as_mut() else {
        return Err(GatewayError::NotRunning);
    };
    let mut line = text.to_string();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| GatewayError::TransportClosed(format!("agent stdin: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| GatewayError::TransportClosed(format!("agent stdin: {e}")))?;
    Ok(())
}
