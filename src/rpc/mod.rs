//! RPC server for client communication.
//!
//! Provides a JSON-RPC 2.0 interface over TCP for drive trust, mount and
//! format operations, backups and snapshot queries.
//!
//! ## Architecture
//!
//! - `protocol`: JSON-RPC 2.0 request/response types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: Method dispatcher and handlers
//! - `client`: Client for connecting to the daemon
//!
//! Domain errors are reported with application codes below -32000 and the
//! error kind in `error.data.kind`.

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::core::BackupOrchestrator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::{FORMAT_CONFIRMATION, MethodHandler};
pub use protocol::{Request, Response, RpcError};

/// RPC server that exposes daemon functionality to clients.
pub struct RpcServer {
    transport: Transport,
}

impl RpcServer {
    /// Bind the listening socket. Port 0 picks a free port.
    pub async fn bind(
        ctx: AppContext,
        backups: Arc<BackupOrchestrator>,
        bind_addr: SocketAddr,
    ) -> anyhow::Result<Self> {
        let handler = MethodHandler::new(ctx, backups);
        let transport = Transport::bind(bind_addr, handler).await?;
        Ok(Self { transport })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve requests until `shutdown` is cancelled.
    pub async fn serve(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.listen(shutdown).await
    }
}
