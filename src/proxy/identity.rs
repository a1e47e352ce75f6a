use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::cli::config::ProxySettings;

/// Failure to obtain a new network identity
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("failed to reach control port {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("control port {0} did not accept the connection in time")]
    Timeout(String),

    #[error("failed to send control command: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can ask the proxy for a fresh exit identity
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityRotator: Send + Sync {
    async fn rotate(&self) -> Result<(), RotationError>;
}

/// Client for the Tor control port
#[derive(Debug, Clone)]
pub struct TorController {
    addr: String,
    password: String,
    timeout: Duration,
}

impl TorController {
    pub fn new(host: &str, port: u16, password: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            password: password.into(),
            timeout,
        }
    }

    /// Build a controller from proxy settings, if a control password is configured
    pub fn from_settings(settings: &ProxySettings) -> Option<Self> {
        settings.control_password.as_ref().map(|password| {
            Self::new(&settings.control_host, settings.control_port, password.clone(), settings.control_timeout())
        })
    }
}

#[async_trait]
impl IdentityRotator for TorController {
    async fn rotate(&self) -> Result<(), RotationError> {
        debug!("Requesting new identity from {}", self.addr);

        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| RotationError::Timeout(self.addr.clone()))?
            .map_err(|source| RotationError::Connect { addr: self.addr.clone(), source })?;

        send_newnym(&mut stream, &self.password).await?;

        info!("New identity requested");
        Ok(())
    }
}

/// Write the authenticate / new identity / quit sequence and close the stream.
///
/// Replies are not read; the control port acts on the commands regardless.
pub async fn send_newnym<W>(stream: &mut W, password: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(format!("AUTHENTICATE \"{}\"\r\n", quote(password)).as_bytes()).await?;
    stream.write_all(b"SIGNAL NEWNYM\r\n").await?;
    stream.write_all(b"QUIT\r\n").await?;
    stream.shutdown().await
}

/// Escape a value for use inside a quoted control-protocol string
fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
