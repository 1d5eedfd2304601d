//! Client for the media proxy's gRPC control-plane contract: connection
//! registration, creation, activation, deletion, and the server-streamed
//! event feed (unlink requests, registration acks, logger changes).

use mcm_proto::mesh_v1::media_proxy_control_client::MediaProxyControlClient;
use mcm_proto::mesh_v1::{
    control_event::Event as RawEvent, ActivateConnectionRequest, CreateConnectionRequest,
    DeleteConnectionRequest, RegisterRequest,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);
const LONG_RPC_TIMEOUT: Duration = Duration::from_secs(20);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(15);
const ACTIVATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to connect to media proxy at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("rpc call timed out")]
    Timeout,
    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("registration with the media proxy timed out or failed")]
    RegistrationFailed,
    #[error("activation was cancelled before the connection linked")]
    ActivationCancelled,
}

/// A control event delivered out-of-band by the proxy's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    ClientRegistered { client_id: String },
    ConnUnlinkRequested { conn_id: String },
    LoggerConfigChanged { level: String },
}

impl From<RawEvent> for ControlEvent {
    fn from(e: RawEvent) -> Self {
        match e {
            RawEvent::ClientRegistered(r) => ControlEvent::ClientRegistered {
                client_id: r.client_id,
            },
            RawEvent::ConnUnlinkRequested(r) => ControlEvent::ConnUnlinkRequested {
                conn_id: r.conn_id,
            },
            RawEvent::LoggerConfigChanged(r) => ControlEvent::LoggerConfigChanged { level: r.level },
        }
    }
}

pub struct MemifConnParam {
    pub socket_path: String,
    pub interface_id: u32,
}

/// Long-lived client for one media proxy endpoint.
pub struct ProxyClient {
    client: MediaProxyControlClient<Channel>,
    events: broadcast::Sender<ControlEvent>,
    event_task: Option<JoinHandle<()>>,
}

impl ProxyClient {
    pub async fn connect(addr: impl Into<String>) -> Result<Self, ProxyError> {
        let addr = addr.into();
        let channel = Channel::from_shared(addr.clone())
            .map_err(|e| ProxyError::Connect {
                addr: addr.clone(),
                source: e,
            })?
            .connect()
            .await
            .map_err(|e| ProxyError::Connect { addr, source: e })?;

        let client = MediaProxyControlClient::new(channel);
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            client,
            events,
            event_task: None,
        })
    }

    /// Subscribes to the proxy's control event stream. Connection contexts
    /// use this to watch for their own `ConnUnlinkRequested` events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Registers with the proxy and starts the background event-stream task.
    /// Blocks until a `ClientRegistered` event arrives or
    /// [`REGISTRATION_TIMEOUT`] elapses.
    pub async fn run(&mut self) -> Result<String, ProxyError> {
        let mut subscription = self.events.subscribe();

        let mut client = self.client.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let request = RegisterRequest {
                requested_client_id: String::new(),
            };
            let stream = match client.register_and_stream_events(request).await {
                Ok(resp) => resp.into_inner(),
                Err(err) => {
                    warn!("register_and_stream_events failed: {err}");
                    return;
                }
            };
            let mut stream = stream;
            loop {
                match tokio_stream::StreamExt::next(&mut stream).await {
                    Some(Ok(msg)) => {
                        if let Some(event) = msg.event {
                            let _ = events.send(event.into());
                        }
                    }
                    Some(Err(err)) => {
                        warn!("control event stream error: {err}");
                        break;
                    }
                    None => {
                        debug!("control event stream closed");
                        break;
                    }
                }
            }
        });
        self.event_task = Some(task);

        let client_id = tokio::time::timeout(REGISTRATION_TIMEOUT, async {
            loop {
                match subscription.recv().await {
                    Ok(ControlEvent::ClientRegistered { client_id }) => return Some(client_id),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
        })
        .await
        .map_err(|_| ProxyError::RegistrationFailed)?
        .ok_or(ProxyError::RegistrationFailed)?;

        info!(client_id = %client_id, "registered with media proxy");
        Ok(client_id)
    }

    pub async fn create_connection(
        &self,
        client_id: &str,
        connection_config_json: &str,
        kind: &str,
    ) -> Result<(String, MemifConnParam), ProxyError> {
        let mut client = self.client.clone();
        let request = CreateConnectionRequest {
            client_id: client_id.to_string(),
            connection_config_json: connection_config_json.to_string(),
            kind: kind.to_string(),
        };
        let resp = tokio::time::timeout(LONG_RPC_TIMEOUT, client.create_connection(request))
            .await
            .map_err(|_| ProxyError::Timeout)??
            .into_inner();
        let memif = resp.memif.unwrap_or_default();
        Ok((
            resp.conn_id,
            MemifConnParam {
                socket_path: memif.socket_path,
                interface_id: memif.interface_id,
            },
        ))
    }

    /// Retries activation every [`ACTIVATE_POLL_INTERVAL`] until the proxy
    /// reports the connection linked, or `cancelled` resolves first.
    pub async fn activate_connection(
        &self,
        client_id: &str,
        conn_id: &str,
        cancelled: impl std::future::Future<Output = ()>,
    ) -> Result<(), ProxyError> {
        tokio::pin!(cancelled);
        loop {
            let mut client = self.client.clone();
            let request = ActivateConnectionRequest {
                client_id: client_id.to_string(),
                conn_id: conn_id.to_string(),
            };
            let activate = tokio::time::timeout(LONG_RPC_TIMEOUT, client.activate_connection(request));

            tokio::select! {
                _ = &mut cancelled => return Err(ProxyError::ActivationCancelled),
                result = activate => {
                    let resp = result.map_err(|_| ProxyError::Timeout)??.into_inner();
                    if resp.linked {
                        return Ok(());
                    }
                }
            }

            tokio::select! {
                _ = &mut cancelled => return Err(ProxyError::ActivationCancelled),
                _ = tokio::time::sleep(ACTIVATE_POLL_INTERVAL) => {}
            }
        }
    }

    pub async fn delete_connection(&self, client_id: &str, conn_id: &str) -> Result<(), ProxyError> {
        let mut client = self.client.clone();
        let request = DeleteConnectionRequest {
            client_id: client_id.to_string(),
            conn_id: conn_id.to_string(),
        };
        tokio::time::timeout(DEFAULT_RPC_TIMEOUT, client.delete_connection(request))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        Ok(())
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_event_conversion_maps_variants() {
        let e: ControlEvent = RawEvent::ConnUnlinkRequested(mcm_proto::mesh_v1::ConnUnlinkRequested {
            conn_id: "abc".into(),
        })
        .into();
        assert_eq!(
            e,
            ControlEvent::ConnUnlinkRequested {
                conn_id: "abc".into()
            }
        );
    }
}
