//! Socket forward connector: one fresh TCP connection per accepted client

use tokio::net::TcpStream;

use crate::forward::runtime::{RemoteConnector, RemoteReadHalf, RemoteWriteHalf};
use crate::{Error, Result};

/// Dials `(host, port)` through the OS resolver for every accepted client.
pub struct SocketConnector {
    host: String,
    port: u16,
}

impl SocketConnector {
    /// Create a connector for the given remote endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait::async_trait]
impl RemoteConnector for SocketConnector {
    async fn connect(&self) -> Result<(RemoteReadHalf, RemoteWriteHalf)> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                Error::RemoteUnreachable(format!("{}:{}: {}", self.host, self.port, e))
            })?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Ok((Box::new(read), Box::new(write)))
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
