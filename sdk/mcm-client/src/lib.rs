//! Client context: registers with a media proxy, tracks the set of live
//! connections, installs process-level signal handling, and owns the global
//! cancellation context every connection derives from.

mod signals;

use mcm_config::{ClientConfig, ConnectionConfig, ConnectionKind};
use mcm_connection::{watch_for_unlink, Connection, ConnectionError};
use mcm_memif::{LocalRingTransport, MEMIF_BUFFER_NUM};
use mcm_proxy_client::{ProxyClient, ProxyError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client configuration: {0}")]
    ClientConfigInvalid(String),
    #[error("invalid connection configuration: {0}")]
    ConnConfigInval(String),
    #[error("incompatible connection configuration: {0}")]
    ConnConfigIncompat(String),
    #[error("maximum number of connections ({0}) reached")]
    MaxConn(u32),
    #[error("client still has allocated connections")]
    FoundAllocated,
    #[error("connection attempt failed: {0}")]
    ConnFailed(String),
    #[error("connection is closed")]
    ConnClosed,
    #[error("requested capability is not implemented: {0}")]
    NotImplemented(String),
}

impl From<mcm_config::ConfigError> for ClientError {
    fn from(e: mcm_config::ConfigError) -> Self {
        match e {
            mcm_config::ConfigError::Invalid(msg) => ClientError::ConnConfigInval(msg),
            mcm_config::ConfigError::Incompatible(msg) => ClientError::ConnConfigIncompat(msg),
        }
    }
}

impl From<ProxyError> for ClientError {
    fn from(e: ProxyError) -> Self {
        ClientError::ConnFailed(e.to_string())
    }
}

impl From<ConnectionError> for ClientError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::BadBufLen { .. } => ClientError::ConnConfigInval(e.to_string()),
            ConnectionError::ConnClosed => ClientError::ConnClosed,
            ConnectionError::ConnFailed(m) => ClientError::ConnFailed(m),
            ConnectionError::Timeout => ClientError::ConnFailed("timeout".into()),
            ConnectionError::NotImplemented(m) => ClientError::NotImplemented(m),
        }
    }
}

/// Owns one proxy registration and the connections created under it.
pub struct ClientContext {
    cfg: ClientConfig,
    proxy: Arc<ProxyClient>,
    client_id: String,
    conns: AsyncMutex<HashMap<String, Arc<Connection>>>,
    ctx: CancellationToken,
}

impl ClientContext {
    /// Parses `client_config_json`, connects to the configured media proxy,
    /// registers, and installs the process-wide signal handler.
    #[instrument(skip(client_config_json))]
    pub async fn create(client_config_json: &str) -> Result<Self, ClientError> {
        let cfg = ClientConfig::parse(client_config_json)
            .map_err(|e| ClientError::ClientConfigInvalid(e.to_string()))?;

        let addr = format!("http://{}:{}", cfg.proxy_ip, cfg.proxy_port);
        let mut proxy = ProxyClient::connect(addr).await?;
        let client_id = proxy.run().await?;

        let ctx = CancellationToken::new();
        signals::install(ctx.clone());

        info!(client_id = %client_id, "client context initialized");

        Ok(Self {
            cfg,
            proxy: Arc::new(proxy),
            client_id,
            conns: AsyncMutex::new(HashMap::new()),
            ctx,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn create_connection(
        &self,
        kind: ConnectionKind,
        connection_config_json: &str,
    ) -> Result<Arc<Connection>, ClientError> {
        let mut conns = self.conns.lock().await;
        if conns.len() as u32 >= self.cfg.max_conn_num {
            return Err(ClientError::MaxConn(self.cfg.max_conn_num));
        }

        let cfg = ConnectionConfig::parse(connection_config_json)?;

        let kind_str = match kind {
            ConnectionKind::Sender => "sender",
            ConnectionKind::Receiver => "receiver",
        };
        let (conn_id, _memif_param) = self
            .proxy
            .create_connection(&self.client_id, connection_config_json, kind_str)
            .await?;

        let frame_size = cfg.buf_parts.total_size() as usize;
        let connection = if cfg.options.engine == "zero-copy" {
            self.build_zero_copy_connection(conn_id.clone(), kind, cfg)?
        } else {
            self.build_memif_connection(conn_id.clone(), kind, cfg, frame_size)
        };

        let connection = Arc::new(connection);
        connection
            .establish()
            .await
            .map_err(|e| ClientError::ConnFailed(e.to_string()))?;

        let watcher_ctx = connection.cancellation_token();
        tokio::spawn(watch_for_unlink(
            self.proxy.subscribe(),
            conn_id.clone(),
            watcher_ctx,
        ));

        conns.insert(conn_id, connection.clone());
        Ok(connection)
    }

    fn build_memif_connection(
        &self,
        conn_id: String,
        kind: ConnectionKind,
        cfg: ConnectionConfig,
        frame_size: usize,
    ) -> Connection {
        // No real libmemif binding is wired in; `LocalRingTransport` stands
        // in for the socket a production build would attach to using the
        // proxy-provisioned memif parameters. One side of the pair is this
        // connection's live endpoint; the other is kept alive (never read)
        // so its channels don't close underneath the live side, the way a
        // real memif socket keeps accepting writes from the peer that owns
        // it regardless of local progress.
        let (tx_ring, rx_ring) = LocalRingTransport::pair(frame_size, MEMIF_BUFFER_NUM);
        let (ring, peer) = match kind {
            ConnectionKind::Sender => (tx_ring, rx_ring),
            ConnectionKind::Receiver => (rx_ring, tx_ring),
        };
        Connection::new(
            conn_id,
            kind,
            cfg,
            ring,
            Some(peer),
            self.proxy.clone(),
            self.client_id.clone(),
            self.ctx.clone(),
        )
    }

    #[cfg(unix)]
    fn build_zero_copy_connection(
        &self,
        conn_id: String,
        kind: ConnectionKind,
        cfg: ConnectionConfig,
    ) -> Result<Connection, ClientError> {
        use mcm_gateway::{GatewayRx, GatewayTx};
        use std::hash::{Hash, Hasher};

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        conn_id.hash(&mut hasher);
        let key = (hasher.finish() as i32).abs();
        let size = cfg.buf_parts.total_size() as usize + 4;

        let (gw_tx, gw_rx, rx_events) = match kind {
            ConnectionKind::Receiver => {
                let (sender, receiver) = std::sync::mpsc::channel::<Vec<u8>>();
                let mut gw_tx = GatewayTx::attach(key, size)
                    .map_err(|e| ClientError::ConnFailed(e.to_string()))?;
                gw_tx.start(move |payload| {
                    let _ = sender.send(payload.to_vec());
                });
                (Some(gw_tx), None, Some(receiver))
            }
            ConnectionKind::Sender => {
                let gw_rx = GatewayRx::attach(key, size)
                    .map_err(|e| ClientError::ConnFailed(e.to_string()))?;
                (None, Some(gw_rx), None)
            }
        };

        Ok(Connection::new_zero_copy(
            conn_id,
            kind,
            cfg,
            gw_tx,
            gw_rx,
            rx_events,
            self.proxy.clone(),
            self.client_id.clone(),
            self.ctx.clone(),
        ))
    }

    #[cfg(not(unix))]
    fn build_zero_copy_connection(
        &self,
        _conn_id: String,
        _kind: ConnectionKind,
        _cfg: ConnectionConfig,
    ) -> Result<Connection, ClientError> {
        Err(ClientError::NotImplemented("zero-copy engine".into()))
    }

    pub async fn create_tx_connection(
        &self,
        connection_config_json: &str,
    ) -> Result<Arc<Connection>, ClientError> {
        self.create_connection(ConnectionKind::Sender, connection_config_json)
            .await
    }

    pub async fn create_rx_connection(
        &self,
        connection_config_json: &str,
    ) -> Result<Arc<Connection>, ClientError> {
        self.create_connection(ConnectionKind::Receiver, connection_config_json)
            .await
    }

    /// Deactivates a connection without untracking it. Idempotent, like the
    /// underlying connection's own `shutdown`.
    pub async fn shutdown_connection(&self, conn_id: &str) -> Result<(), ClientError> {
        let connection = {
            let conns = self.conns.lock().await;
            conns.get(conn_id).cloned()
        };
        match connection {
            Some(conn) => Ok(conn.shutdown().await?),
            None => Ok(()),
        }
    }

    /// Deactivates (if not already) and untracks a connection, freeing its
    /// slot against `max_conn_num`.
    pub async fn delete_connection(&self, conn_id: &str) -> Result<(), ClientError> {
        let connection = {
            let mut conns = self.conns.lock().await;
            conns.remove(conn_id)
        };
        match connection {
            Some(conn) => {
                conn.shutdown().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Refuses to shut down while any connection is still allocated, as the
    /// original implementation's `FOUND_ALLOCATED` guard requires.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        if !self.conns.lock().await.is_empty() {
            return Err(ClientError::FoundAllocated);
        }
        self.ctx.cancel();
        Ok(())
    }

    pub fn default_timeout_us(&self) -> i64 {
        self.cfg.default_timeout_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_wraps_config_error_variants() {
        let e: ClientError = mcm_config::ConfigError::Incompatible("x".into()).into();
        assert!(matches!(e, ClientError::ConnConfigIncompat(_)));
        let e: ClientError = mcm_config::ConfigError::Invalid("y".into()).into();
        assert!(matches!(e, ClientError::ConnConfigInval(_)));
    }
}
