//! Connection context: owns one endpoint (memif ring or zero-copy gateway),
//! the validated configuration, and a cancellation token; exposes the
//! buffer-exchange contract used by the public SDK surface.

use mcm_buffer::{BufferPartitions, BufferSysData};
use mcm_config::{ConnectionConfig, ConnectionKind};
use mcm_gateway::{GatewayError, GatewayRx, GatewayTx};
use mcm_memif::{DequeueTimeout, MemifError, MemifTransport, RingHandle};
use mcm_proxy_client::{ControlEvent, ProxyClient};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Sender-side pre-shutdown drain delay: lets in-flight buffers land at the
/// peer before the connection is torn down.
const SENDER_DRAIN_DELAY: Duration = Duration::from_millis(50);
/// Upper bound on how long the receiver-side drain loop runs concurrently
/// with the proxy's `delete_connection` RPC during shutdown.
const RECEIVER_DRAIN_DEADLINE: Duration = Duration::from_millis(500);
/// Yield interval between receiver-side drain attempts, so the concurrent
/// `delete_connection` RPC gets polled in between.
const RECEIVER_DRAIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("buffer length {got} is incompatible with partition capacity {cap}")]
    BadBufLen { got: u32, cap: u32 },
    #[error("connection is closed")]
    ConnClosed,
    #[error("connection attempt failed: {0}")]
    ConnFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("requested capability is not implemented: {0}")]
    NotImplemented(String),
}

impl From<MemifError> for ConnectionError {
    fn from(e: MemifError) -> Self {
        match e {
            MemifError::Timeout => ConnectionError::Timeout,
            MemifError::Closed => ConnectionError::ConnClosed,
            MemifError::BadBufLen { got, expected } => ConnectionError::BadBufLen {
                got: got as u32,
                cap: expected as u32,
            },
        }
    }
}

impl From<GatewayError> for ConnectionError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::WrongState => ConnectionError::ConnClosed,
            GatewayError::NotImplemented => {
                ConnectionError::NotImplemented("zero-copy gateway".into())
            }
            other => ConnectionError::ConnFailed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Active,
    Shutdown,
}

/// A buffer handed to the user by [`Connection::get_buffer`], carrying a
/// non-owning back-reference to the partition layout it was cut from.
pub struct Buffer {
    data: Vec<u8>,
    parts: BufferPartitions,
    pub payload_len: u32,
    pub metadata_len: u32,
}

impl Buffer {
    fn new(data: Vec<u8>, parts: BufferPartitions) -> Self {
        Self {
            data,
            parts,
            payload_len: 0,
            metadata_len: 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        let p = &self.parts.payload;
        &self.data[p.offset as usize..(p.offset + self.payload_len) as usize]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let p = &self.parts.payload;
        let len = self.payload_len;
        &mut self.data[p.offset as usize..(p.offset + len) as usize]
    }

    pub fn metadata(&self) -> &[u8] {
        let p = &self.parts.metadata;
        &self.data[p.offset as usize..(p.offset + self.metadata_len) as usize]
    }

    pub fn set_payload_len(&mut self, n: u32) -> Result<(), ConnectionError> {
        if n > self.parts.payload.size {
            return Err(ConnectionError::BadBufLen {
                got: n,
                cap: self.parts.payload.size,
            });
        }
        self.payload_len = n;
        Ok(())
    }

    pub fn set_metadata_len(&mut self, n: u32) -> Result<(), ConnectionError> {
        if n > self.parts.metadata.size {
            return Err(ConnectionError::BadBufLen {
                got: n,
                cap: self.parts.metadata.size,
            });
        }
        self.metadata_len = n;
        Ok(())
    }
}

/// Resolves the public timeout convention (`DEFAULT = -2`, `INFINITE = -1`,
/// `ZERO = 0`, positive milliseconds) against a client-level default.
pub fn resolve_timeout(timeout_ms: i64, client_default_ms: i64) -> DequeueTimeout {
    match timeout_ms {
        -2 => DequeueTimeout::from(client_default_ms),
        other => DequeueTimeout::from(other),
    }
}

enum Endpoint {
    Memif(RingHandle),
    ZeroCopy(ZeroCopyEndpoint),
}

struct ZeroCopyEndpoint {
    gw_tx: Mutex<Option<GatewayTx>>,
    gw_rx: Mutex<Option<GatewayRx>>,
    rx_events: Mutex<Option<std::sync::mpsc::Receiver<Vec<u8>>>>,
}

impl Endpoint {
    fn get_buffer(&self, timeout: DequeueTimeout) -> Result<Vec<u8>, ConnectionError> {
        match self {
            Endpoint::Memif(ring) => Ok(ring.dequeue(timeout)?),
            Endpoint::ZeroCopy(zc) => {
                let rx = zc.rx_events.lock().unwrap();
                let rx = rx.as_ref().ok_or(ConnectionError::ConnClosed)?;
                match timeout {
                    DequeueTimeout::NonBlocking => {
                        rx.try_recv().map_err(|_| ConnectionError::Timeout)
                    }
                    DequeueTimeout::Infinite => {
                        rx.recv().map_err(|_| ConnectionError::ConnClosed)
                    }
                    DequeueTimeout::Bounded(d) => {
                        rx.recv_timeout(d).map_err(|_| ConnectionError::Timeout)
                    }
                }
            }
        }
    }

    fn put_buffer(&self, buf: Vec<u8>) -> Result<(), ConnectionError> {
        match self {
            Endpoint::Memif(ring) => Ok(ring.enqueue(buf)?),
            Endpoint::ZeroCopy(zc) => {
                let mut gw_rx = zc.gw_rx.lock().unwrap();
                let gw_rx = gw_rx.as_mut().ok_or(ConnectionError::ConnClosed)?;
                gw_rx.transmit(&buf)?;
                Ok(())
            }
        }
    }

    fn close(&self) {
        match self {
            Endpoint::Memif(ring) => ring.close(),
            Endpoint::ZeroCopy(zc) => {
                if let Some(rx) = zc.gw_rx.lock().unwrap().as_mut() {
                    rx.shutdown();
                }
            }
        }
    }
}

/// One established (or establishing) connection between this client and the
/// media proxy.
pub struct Connection {
    id: String,
    kind: ConnectionKind,
    cfg: ConnectionConfig,
    endpoint: Endpoint,
    proxy: Arc<ProxyClient>,
    client_id: String,
    state: Mutex<ConnectionState>,
    ctx: CancellationToken,
    // The unused half of a `LocalRingTransport` pair, if any. Never read;
    // held only so its channel endpoints stay open for this connection's
    // real peer side, matching a real memif socket that keeps accepting
    // writes whether or not anything is draining it yet.
    _peer_keepalive: Option<RingHandle>,
}

impl Connection {
    pub fn new(
        id: String,
        kind: ConnectionKind,
        cfg: ConnectionConfig,
        endpoint_ring: RingHandle,
        peer_keepalive: Option<RingHandle>,
        proxy: Arc<ProxyClient>,
        client_id: String,
        parent_ctx: CancellationToken,
    ) -> Self {
        Self {
            id,
            kind,
            cfg,
            endpoint: Endpoint::Memif(endpoint_ring),
            proxy,
            client_id,
            state: Mutex::new(ConnectionState::Created),
            ctx: parent_ctx.child_token(),
            _peer_keepalive: peer_keepalive,
        }
    }

    pub fn new_zero_copy(
        id: String,
        kind: ConnectionKind,
        cfg: ConnectionConfig,
        gw_tx: Option<GatewayTx>,
        gw_rx: Option<GatewayRx>,
        rx_events: Option<std::sync::mpsc::Receiver<Vec<u8>>>,
        proxy: Arc<ProxyClient>,
        client_id: String,
        parent_ctx: CancellationToken,
    ) -> Self {
        Self {
            id,
            kind,
            cfg,
            endpoint: Endpoint::ZeroCopy(ZeroCopyEndpoint {
                gw_tx: Mutex::new(gw_tx),
                gw_rx: Mutex::new(gw_rx),
                rx_events: Mutex::new(rx_events),
            }),
            proxy,
            client_id,
            state: Mutex::new(ConnectionState::Created),
            ctx: parent_ctx.child_token(),
            _peer_keepalive: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Moves the connection from `Created` to `Active`: creates it at the
    /// proxy, then retries activation until linked or cancelled.
    #[instrument(skip(self), fields(conn_id = %self.id))]
    pub async fn establish(&self) -> Result<(), ConnectionError> {
        // create_connection already ran by the time a Connection exists
        // (the caller needs its memif params to build the endpoint); this
        // only drives the activation retry loop.
        let ctx = self.ctx.clone();
        self.proxy
            .activate_connection(&self.client_id, &self.id, ctx.cancelled())
            .await
            .map_err(|e| ConnectionError::ConnFailed(e.to_string()))?;

        *self.state.lock().unwrap() = ConnectionState::Active;
        info!("connection established");
        Ok(())
    }

    #[instrument(skip(self), fields(conn_id = %self.id))]
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Shutdown {
                return Ok(());
            }
            *state = ConnectionState::Shutdown;
        }
        self.ctx.cancel();

        let delete = self.proxy.delete_connection(&self.client_id, &self.id);
        let delete_result = match self.kind {
            ConnectionKind::Sender => {
                tokio::time::sleep(SENDER_DRAIN_DELAY).await;
                delete.await
            }
            ConnectionKind::Receiver => {
                // Drain concurrently with the delete RPC rather than before
                // it: the proxy tears the connection down while this side
                // keeps pulling buffers off the ring, so a peer still
                // writing during that window doesn't find it full.
                let drain = async {
                    let deadline = tokio::time::Instant::now() + RECEIVER_DRAIN_DEADLINE;
                    while tokio::time::Instant::now() < deadline {
                        match self.endpoint.get_buffer(DequeueTimeout::NonBlocking) {
                            Ok(buf) => {
                                if self.endpoint.put_buffer(buf).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                        tokio::time::sleep(RECEIVER_DRAIN_TICK).await;
                    }
                };
                let (_, result) = tokio::join!(drain, delete);
                result
            }
        };

        self.endpoint.close();

        if let Err(err) = delete_result {
            warn!("delete_connection during shutdown failed: {err}");
        }
        Ok(())
    }

    pub fn get_buffer(&self, timeout_ms: i64, client_default_ms: i64) -> Result<Buffer, ConnectionError> {
        if self.ctx.is_cancelled() {
            return Err(ConnectionError::ConnClosed);
        }
        let timeout = resolve_timeout(timeout_ms, client_default_ms);
        let data = self.endpoint.get_buffer(timeout)?;

        let sysdata = BufferSysData::decode(&data)
            .map_err(|_| ConnectionError::BadBufLen {
                got: data.len() as u32,
                cap: self.cfg.buf_parts.total_size(),
            })?
            .clamp_to(&self.cfg.buf_parts);

        let mut buf = Buffer::new(data, self.cfg.buf_parts);
        buf.payload_len = match self.kind {
            // Senders get a fresh buffer pre-sized to the calculated
            // payload; receivers get whatever the peer actually sent.
            ConnectionKind::Sender => self.cfg.calculated_payload_size,
            ConnectionKind::Receiver => sysdata.payload_len,
        };
        buf.metadata_len = match self.kind {
            ConnectionKind::Sender => 0,
            ConnectionKind::Receiver => sysdata.metadata_len,
        };
        Ok(buf)
    }

    pub fn put_buffer(&self, mut buf: Buffer) -> Result<(), ConnectionError> {
        if self.ctx.is_cancelled() {
            return Err(ConnectionError::ConnClosed);
        }
        if matches!(self.kind, ConnectionKind::Sender) {
            // TODO: implement incremental seq numbers and a timestamp clock
            // source; left at zero per the upstream contract.
            let sysdata = BufferSysData {
                timestamp_ms: 0,
                seq: 0,
                payload_len: buf.payload_len,
                metadata_len: buf.metadata_len,
            };
            sysdata
                .encode(&mut buf.data)
                .map_err(|_| ConnectionError::BadBufLen {
                    got: buf.data.len() as u32,
                    cap: self.cfg.buf_parts.total_size(),
                })?;
        }
        self.endpoint.put_buffer(buf.data)
    }

    /// True if an unlink event for this connection has been observed (used
    /// by a background watcher task spawned by the client context).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.clone()
    }
}

/// Watches a proxy event subscription and cancels `ctx` when a matching
/// `ConnUnlinkRequested` event for `conn_id` arrives.
pub async fn watch_for_unlink(
    mut events: tokio::sync::broadcast::Receiver<ControlEvent>,
    conn_id: String,
    ctx: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            event = events.recv() => {
                match event {
                    Ok(ControlEvent::ConnUnlinkRequested { conn_id: id }) if id == conn_id => {
                        debug!(conn_id = %id, "unlink requested, cancelling connection context");
                        ctx.cancel();
                        return;
                    }
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        }
    }
}

pub use mcm_proxy_client::MemifConnParam as ProxyMemifConnParam;
