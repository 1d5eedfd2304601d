//! Headless smoke-test harness: establishes a tx or rx connection against a
//! configured media proxy and exchanges a handful of buffers. Used for
//! manual testing and as the process a CI smoke test drives; it is not part
//! of the public library surface.

use clap::Parser;
use mcm_sdk::{Client, MeshError};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON file containing the client configuration.
    #[arg(long)]
    client_config: String,

    /// Path to a JSON file containing the connection configuration.
    #[arg(long)]
    connection_config: String,

    /// Create a sender connection instead of a receiver.
    #[arg(long)]
    tx: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), MeshError> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client_config_json = std::fs::read_to_string(&args.client_config)
        .unwrap_or_else(|_| "{}".to_string());
    let connection_config_json = std::fs::read_to_string(&args.connection_config)
        .unwrap_or_else(|_| "{}".to_string());

    let client = Client::create(&client_config_json).await?;

    let conn = if args.tx {
        client.create_tx_connection(&connection_config_json).await?
    } else {
        client.create_rx_connection(&connection_config_json).await?
    };

    tracing::info!(conn_id = %conn.id(), "connection established, exchanging one buffer");

    if args.tx {
        let mut buf = conn.get_buffer()?;
        buf.set_payload_len(buf.payload().len() as u32)?;
        conn.put_buffer(buf)?;
    } else {
        let buf = conn.get_buffer_timeout(mcm_sdk::timeout::INFINITE)?;
        tracing::info!(len = buf.payload().len(), "received buffer");
    }

    conn.shutdown().await?;
    conn.delete().await?;
    Ok(())
}
