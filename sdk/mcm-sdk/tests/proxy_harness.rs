//! End-to-end loopback test: a minimal in-process `MediaProxyControl` mock
//! server drives the full `Client::create` -> connection establish ->
//! buffer exchange -> shutdown cycle without a live media proxy process.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use mcm_proto::mesh_v1::media_proxy_control_server::{MediaProxyControl, MediaProxyControlServer};
use mcm_proto::mesh_v1::{
    control_event, ActivateConnectionRequest, ActivateConnectionResponse, ClientRegistered,
    ControlEvent, CreateConnectionRequest, CreateConnectionResponse, DeleteConnectionRequest,
    DeleteConnectionResponse, MemifConnParam, RegisterRequest,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

struct MockProxy {
    next_conn_id: Arc<Mutex<u32>>,
}

#[tonic::async_trait]
impl MediaProxyControl for MockProxy {
    type RegisterAndStreamEventsStream =
        Pin<Box<dyn tokio_stream::Stream<Item = Result<ControlEvent, Status>> + Send + 'static>>;

    async fn register_and_stream_events(
        &self,
        _request: Request<RegisterRequest>,
    ) -> Result<Response<Self::RegisterAndStreamEventsStream>, Status> {
        let event = ControlEvent {
            event: Some(control_event::Event::ClientRegistered(ClientRegistered {
                client_id: "mock-client".to_string(),
            })),
        };
        let stream = tokio_stream::once(Ok(event)).chain(tokio_stream::pending());
        Ok(Response::new(Box::pin(stream)))
    }

    async fn create_connection(
        &self,
        request: Request<CreateConnectionRequest>,
    ) -> Result<Response<CreateConnectionResponse>, Status> {
        let _req = request.into_inner();
        let mut next = self.next_conn_id.lock().await;
        *next += 1;
        let conn_id = format!("conn-{}", *next);
        Ok(Response::new(CreateConnectionResponse {
            conn_id,
            memif: Some(MemifConnParam {
                socket_path: "/tmp/mock.sock".to_string(),
                interface_id: 0,
            }),
        }))
    }

    async fn activate_connection(
        &self,
        _request: Request<ActivateConnectionRequest>,
    ) -> Result<Response<ActivateConnectionResponse>, Status> {
        Ok(Response::new(ActivateConnectionResponse { linked: true }))
    }

    async fn delete_connection(
        &self,
        _request: Request<DeleteConnectionRequest>,
    ) -> Result<Response<DeleteConnectionResponse>, Status> {
        Ok(Response::new(DeleteConnectionResponse {}))
    }
}

async fn spawn_mock_proxy() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let proxy = MockProxy {
        next_conn_id: Arc::new(Mutex::new(0)),
    };

    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(MediaProxyControlServer::new(proxy))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    // Give the listener task a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

const BLOB_CONFIG: &str = r#"{
    "maxPayloadSize": 1024,
    "connection": { "multipointGroup": { "urn": "ipv4:224.0.0.1:20000" } },
    "payload": { "blob": {} }
}"#;

#[tokio::test]
async fn tx_rx_roundtrip_against_mock_proxy() {
    let addr = spawn_mock_proxy().await;
    let client_config = format!(
        r#"{{ "apiConnectionString": "Server={}; Port={}" }}"#,
        addr.ip(),
        addr.port()
    );

    let client = mcm_sdk::Client::create(&client_config)
        .await
        .expect("client should register with the mock proxy");

    let tx_conn = client
        .create_tx_connection(BLOB_CONFIG)
        .await
        .expect("tx connection should establish");
    let rx_conn = client
        .create_rx_connection(BLOB_CONFIG)
        .await
        .expect("rx connection should establish");

    assert_ne!(tx_conn.id(), rx_conn.id());

    let mut buf = tx_conn.get_buffer().expect("tx get_buffer should succeed");
    let payload_len = buf.payload().len() as u32;
    buf.set_payload_len(payload_len).unwrap();
    tx_conn.put_buffer(buf).expect("tx put_buffer should succeed");

    // tx_conn and rx_conn are independent connections against the mock
    // proxy (distinct conn_ids, unwired rings), so rx_conn has no producer
    // in this test; a bounded wait exercises the same get_buffer path
    // without hanging.
    let err = rx_conn
        .get_buffer_timeout(50)
        .expect_err("rx get_buffer should time out with no producer wired up");
    assert!(matches!(err, mcm_sdk::MeshError::Timeout));

    tx_conn.shutdown().await.expect("tx shutdown should succeed");
    rx_conn.shutdown().await.expect("rx shutdown should succeed");
    tx_conn.delete().await.expect("tx delete should succeed");
    rx_conn.delete().await.expect("rx delete should succeed");

    client.shutdown().await.expect("client shutdown should succeed once connections are gone");
}

#[tokio::test]
async fn shutdown_rejects_while_connections_are_allocated() {
    let addr = spawn_mock_proxy().await;
    let client_config = format!(
        r#"{{ "apiConnectionString": "Server={}; Port={}" }}"#,
        addr.ip(),
        addr.port()
    );

    let client = mcm_sdk::Client::create(&client_config).await.unwrap();
    let conn = client.create_tx_connection(BLOB_CONFIG).await.unwrap();

    let err = client.shutdown().await.unwrap_err();
    assert!(matches!(err, mcm_sdk::MeshError::FoundAllocated));

    // shutdown() alone deactivates but does not untrack the connection, so
    // the client would still refuse; delete() is required to free the slot.
    conn.shutdown().await.unwrap();
    let err = client.shutdown().await.unwrap_err();
    assert!(matches!(err, mcm_sdk::MeshError::FoundAllocated));

    conn.delete().await.unwrap();
    client.shutdown().await.unwrap();
}
