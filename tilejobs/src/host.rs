//! Child side of process-isolated execution.
//!
//! The coordinator launches a host process per job, writes one [`Invocation`] as
//! JSON to its stdin and reads one [`HostReply`] from its stdout. Everything the
//! host logs goes to stderr, which the coordinator forwards into its own log.

use crate::errors::{DispatchError, Result};
use crate::events::Outcome;
use crate::registry::{invoke, Invocation, WorkerRegistry};
use crate::shutdown::install_shutdown_handler;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostReply {
    pub outcome: Outcome,
}

pub async fn serve<R, W>(
    registry: &WorkerRegistry,
    mut input: R,
    mut output: W,
    cancel: CancellationToken,
) -> Result<Outcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = Vec::new();
    input.read_to_end(&mut raw).await?;
    let invocation: Invocation = serde_json::from_slice(&raw)
        .map_err(|e| DispatchError::Host(format!("unreadable invocation: {e}")))?;

    let digest = invocation.descriptor.digest();
    tracing::debug!(digest = %digest.short(), worker = %invocation.spec.worker, "host running job");
    let outcome = invoke(registry, invocation, cancel).await;

    let mut reply = serde_json::to_vec(&HostReply {
        outcome: outcome.clone(),
    })?;
    reply.push(b'\n');
    output.write_all(&reply).await?;
    output.flush().await?;
    Ok(outcome)
}

/// Serve the invocation on this process's stdin, replying on stdout.
///
/// SIGTERM or SIGINT cancels the job, which still gets its log footer and a reply.
pub async fn run_host(registry: &WorkerRegistry) -> Result<Outcome> {
    let cancel = install_shutdown_handler()?;
    serve(registry, tokio::io::stdin(), tokio::io::stdout(), cancel).await
}
