//! RPC client for connecting to the daemon.
//!
//! Provides a simple client for sending JSON-RPC requests to the daemon.

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{Request, Response, RpcError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// RPC client for communicating with the daemon.
pub struct RpcClient {
    addr: SocketAddr,
}

/// Error returned by RPC client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize request: {0}")]
    Serialize(serde_json::Error),
    #[error("Failed to parse response: {0}")]
    Parse(serde_json::Error),
    #[error("Daemon closed the connection without answering")]
    Closed,
    #[error("{}", .0.message)]
    Rpc(RpcError),
}

impl ClientError {
    /// Error kind reported by the daemon, e.g. `already_running`.
    pub fn kind(&self) -> Option<&str> {
        match self {
            ClientError::Rpc(e) => e.data.as_ref()?.get("kind")?.as_str(),
            _ => None,
        }
    }
}

impl RpcClient {
    /// Create a new client that will connect to the given address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        let connect = TcpStream::connect(self.addr);
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ClientError::Connect {
                addr: self.addr,
                source,
            }),
            Err(_) => Err(ClientError::Connect {
                addr: self.addr,
                source: std::io::ErrorKind::TimedOut.into(),
            }),
        }
    }

    /// Call an RPC method and return the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let mut stream = self.connect().await?;

        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::Number(1.into())),
        };

        let mut request_json = serde_json::to_string(&request).map_err(ClientError::Serialize)?;
        request_json.push('\n');
        stream.write_all(request_json.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        if reader.read_line(&mut response_line).await? == 0 {
            return Err(ClientError::Closed);
        }

        let response: Response =
            serde_json::from_str(&response_line).map_err(ClientError::Parse)?;

        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }

        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(ClientError::Parse)
    }

    /// Call an RPC method with no parameters.
    pub async fn call_no_params<T: DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<T, ClientError> {
        self.call(method, None).await
    }
}
