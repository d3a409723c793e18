//! main.rs — TCP forwarder for DesBridge telemetry
//!
//! Relays the sensor-fusion bridge's byte stream between machines: listens
//! where the bridge expects its peer and forwards every connection to the
//! machine actually running the depth controller. Purely transport, no
//! telegram awareness.

use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bridge-proxy", about = "TCP forwarder for DesBridge telemetry")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 12000)]
    listen_port: u16,
    /// Target host IP (machine running the depth controller)
    #[arg(long, default_value = "140.102.0.10")]
    target_host: String,
    /// Target host port
    #[arg(long, default_value_t = 12000)]
    target_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bridge_proxy=info".into()),
        )
        .init();

    let args = Args::parse();

    let listener = TcpListener::bind(("0.0.0.0", args.listen_port)).await?;
    info!(
        "TCP proxy listening on port {}, forwarding to {}:{}",
        args.listen_port, args.target_host, args.target_port
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down proxy");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((client, addr)) => {
                        info!("Connection from {addr}");
                        let target_host = args.target_host.clone();
                        let target_port = args.target_port;
                        tokio::spawn(proxy_connection(client, target_host, target_port));
                    }
                    Err(e) => warn!("Accept error: {e}"),
                }
            }
        }
    }

    Ok(())
}

/// Forward bytes both ways until either side closes.
async fn proxy_connection(mut client: TcpStream, target_host: String, target_port: u16) {
    let mut upstream = match TcpStream::connect((target_host.as_str(), target_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Proxy error: could not reach {target_host}:{target_port}: {e}");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_target, to_client)) => {
            debug!("Connection closed ({to_target} B forwarded, {to_client} B returned)");
        }
        Err(e) => debug!("Forwarding ended: {e}"),
    }
}
