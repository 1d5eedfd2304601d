//! Public SDK surface: `Client`/`Connection` handles over the lower-level
//! `mcm-client`/`mcm-connection` crates, and the unified error taxonomy
//! every component's error converts into.

use std::sync::Arc;
use thiserror::Error;

pub use mcm_buffer::{BufferPartitions, BufferSysData};
pub use mcm_connection::Buffer;

/// Timeout sentinel values shared by every timed SDK call.
pub mod timeout {
    /// Use the client's configured default timeout.
    pub const DEFAULT: i64 = -2;
    /// Block until an event or cancellation, with no deadline.
    pub const INFINITE: i64 = -1;
    /// Never block; return immediately if nothing is available.
    pub const ZERO: i64 = 0;
}

/// Stable numeric identity for each error condition, starting at 1000 to
/// avoid colliding with lower application-defined ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    BadClientPtr = 1000,
    BadConnPtr = 1001,
    BadConfigPtr = 1002,
    BadBufPtr = 1003,
    BadBufLen = 1004,
    ClientConfigInval = 1005,
    MaxConn = 1006,
    FoundAllocated = 1007,
    ConnFailed = 1008,
    ConnConfigInval = 1009,
    ConnConfigIncompat = 1010,
    ConnClosed = 1011,
    Timeout = 1012,
    NotImplemented = 1013,
}

/// The crate's single error type. Every lower-level error converts into one
/// of these variants; [`MeshError::code`] and the `Display` impl (acting as
/// the `err2str` equivalent) expose a stable identity for callers.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("bad client handle")]
    BadClientPtr,
    #[error("bad connection handle")]
    BadConnPtr,
    #[error("bad configuration")]
    BadConfigPtr,
    #[error("bad buffer handle")]
    BadBufPtr,
    #[error("bad buffer length: {0}")]
    BadBufLen(String),
    #[error("invalid client configuration: {0}")]
    ClientConfigInval(String),
    #[error("maximum number of connections reached: {0}")]
    MaxConn(String),
    #[error("client still has allocated connections")]
    FoundAllocated,
    #[error("connection attempt failed: {0}")]
    ConnFailed(String),
    #[error("invalid connection configuration: {0}")]
    ConnConfigInval(String),
    #[error("incompatible connection configuration: {0}")]
    ConnConfigIncompat(String),
    #[error("connection is closed")]
    ConnClosed,
    #[error("operation timed out")]
    Timeout,
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl MeshError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MeshError::BadClientPtr => ErrorCode::BadClientPtr,
            MeshError::BadConnPtr => ErrorCode::BadConnPtr,
            MeshError::BadConfigPtr => ErrorCode::BadConfigPtr,
            MeshError::BadBufPtr => ErrorCode::BadBufPtr,
            MeshError::BadBufLen(_) => ErrorCode::BadBufLen,
            MeshError::ClientConfigInval(_) => ErrorCode::ClientConfigInval,
            MeshError::MaxConn(_) => ErrorCode::MaxConn,
            MeshError::FoundAllocated => ErrorCode::FoundAllocated,
            MeshError::ConnFailed(_) => ErrorCode::ConnFailed,
            MeshError::ConnConfigInval(_) => ErrorCode::ConnConfigInval,
            MeshError::ConnConfigIncompat(_) => ErrorCode::ConnConfigIncompat,
            MeshError::ConnClosed => ErrorCode::ConnClosed,
            MeshError::Timeout => ErrorCode::Timeout,
            MeshError::NotImplemented(_) => ErrorCode::NotImplemented,
        }
    }

    /// Human-readable label for the error, the `err2str` equivalent.
    pub fn err2str(&self) -> String {
        self.to_string()
    }
}

impl From<mcm_client::ClientError> for MeshError {
    fn from(e: mcm_client::ClientError) -> Self {
        match e {
            mcm_client::ClientError::ClientConfigInvalid(m) => MeshError::ClientConfigInval(m),
            mcm_client::ClientError::ConnConfigInval(m) => MeshError::ConnConfigInval(m),
            mcm_client::ClientError::ConnConfigIncompat(m) => MeshError::ConnConfigIncompat(m),
            mcm_client::ClientError::MaxConn(n) => MeshError::MaxConn(n.to_string()),
            mcm_client::ClientError::FoundAllocated => MeshError::FoundAllocated,
            mcm_client::ClientError::ConnFailed(m) => MeshError::ConnFailed(m),
            mcm_client::ClientError::ConnClosed => MeshError::ConnClosed,
            mcm_client::ClientError::NotImplemented(m) => MeshError::NotImplemented(m),
        }
    }
}

impl From<mcm_connection::ConnectionError> for MeshError {
    fn from(e: mcm_connection::ConnectionError) -> Self {
        match e {
            mcm_connection::ConnectionError::BadBufLen { got, cap } => {
                MeshError::BadBufLen(format!("{got} exceeds partition capacity {cap}"))
            }
            mcm_connection::ConnectionError::ConnClosed => MeshError::ConnClosed,
            mcm_connection::ConnectionError::ConnFailed(m) => MeshError::ConnFailed(m),
            mcm_connection::ConnectionError::Timeout => MeshError::Timeout,
            mcm_connection::ConnectionError::NotImplemented(m) => MeshError::NotImplemented(m),
        }
    }
}

/// A mesh client: owns a proxy registration and the connections created
/// under it.
pub struct Client {
    inner: Arc<mcm_client::ClientContext>,
}

impl Client {
    pub async fn create(client_config_json: &str) -> Result<Self, MeshError> {
        let inner = mcm_client::ClientContext::create(client_config_json).await?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub async fn create_tx_connection(
        &self,
        connection_config_json: &str,
    ) -> Result<Connection, MeshError> {
        let inner = self.inner.create_tx_connection(connection_config_json).await?;
        Ok(Connection {
            client: self.inner.clone(),
            id: inner.id().to_string(),
            inner,
            default_timeout_us: self.inner.default_timeout_us(),
        })
    }

    pub async fn create_rx_connection(
        &self,
        connection_config_json: &str,
    ) -> Result<Connection, MeshError> {
        let inner = self.inner.create_rx_connection(connection_config_json).await?;
        Ok(Connection {
            client: self.inner.clone(),
            id: inner.id().to_string(),
            inner,
            default_timeout_us: self.inner.default_timeout_us(),
        })
    }

    pub async fn shutdown(&self) -> Result<(), MeshError> {
        Ok(self.inner.shutdown().await?)
    }
}

/// One established connection; buffers are exchanged through
/// [`Connection::get_buffer`]/[`Connection::put_buffer`] and their
/// `_timeout` variants.
pub struct Connection {
    client: Arc<mcm_client::ClientContext>,
    inner: Arc<mcm_connection::Connection>,
    id: String,
    default_timeout_us: i64,
}

impl Connection {
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Deactivates the connection: drains and tears down its endpoint and
    /// tells the proxy to unlink it. Idempotent, and does not untrack the
    /// connection from the owning client — call [`Connection::delete`] to
    /// also free its slot.
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        Ok(self.client.shutdown_connection(&self.id).await?)
    }

    /// Shuts the connection down (if not already) and untracks it from the
    /// owning client, freeing its slot against `max_conn_num`. Consumes the
    /// handle since the connection no longer exists afterward.
    pub async fn delete(self) -> Result<(), MeshError> {
        Ok(self.client.delete_connection(&self.id).await?)
    }

    pub fn get_buffer(&self) -> Result<Buffer, MeshError> {
        self.get_buffer_timeout(timeout::DEFAULT)
    }

    pub fn get_buffer_timeout(&self, timeout_ms: i64) -> Result<Buffer, MeshError> {
        Ok(self
            .inner
            .get_buffer(timeout_ms, self.default_timeout_us / 1000)?)
    }

    pub fn put_buffer(&self, buf: Buffer) -> Result<(), MeshError> {
        Ok(self.inner.put_buffer(buf)?)
    }

    pub fn put_buffer_timeout(&self, buf: Buffer, _timeout_ms: i64) -> Result<(), MeshError> {
        // Enqueue does not block on transport flow control (see the memif
        // contract), so the timeout only bounds `get_buffer`.
        Ok(self.inner.put_buffer(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_start_at_1000_and_are_stable() {
        assert_eq!(ErrorCode::BadClientPtr as i32, 1000);
        assert_eq!(ErrorCode::NotImplemented as i32, 1013);
    }

    #[test]
    fn err2str_matches_display() {
        let e = MeshError::ConnClosed;
        assert_eq!(e.err2str(), "connection is closed");
        assert_eq!(e.code(), ErrorCode::ConnClosed);
    }

    #[test]
    fn client_error_conversion_preserves_max_conn() {
        let e: MeshError = mcm_client::ClientError::MaxConn(32).into();
        assert_eq!(e.code(), ErrorCode::MaxConn);
    }
}
