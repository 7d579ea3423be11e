use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_quic_transport::{
    ConnectionContext, DispatchError, EndpointInformation, ListenMode, QuicConfiguration,
    QuicTransport,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn echo(mut connection: ConnectionContext, received: Arc<AtomicU64>) {
    let id = connection.connection_id;
    loop {
        match connection.input.read_chunk().await {
            Ok(Some(chunk)) => {
                received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                if let Err(err) = connection.output.write(&chunk).await {
                    debug!(connection_id = %id, error = %err, "echo write failed");
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(connection_id = %id, error = %err, "connection ended");
                break;
            }
        }
    }
    connection.output.complete(None);
}

#[tokio::main]
async fn main() {
    init_logging();

    let mut args = std::env::args().skip(1);
    let mode = match args.next().as_deref() {
        Some("tcp") => ListenMode::Stream,
        _ => ListenMode::Datagram,
    };
    let addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "0.0.0.0:9000".to_owned())
        .parse()
        .unwrap();

    let received = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(Notify::new());
    let endpoint = Arc::new(RwLock::new(EndpointInformation::new(addr)));

    let transport = {
        let received = received.clone();
        let stop = stop.clone();
        QuicTransport::new(
            endpoint.clone(),
            Arc::new(move |connection: ConnectionContext| -> Result<(), DispatchError> {
                info!(connection_id = %connection.connection_id, peer = %connection.remote_addr, "accepted connection");
                tokio::spawn(echo(connection, received.clone()));
                Ok(())
            }),
            Arc::new(move || stop.notify_one()),
            QuicConfiguration {
                mode,
                ..Default::default()
            },
        )
        .unwrap()
    };

    transport.bind().await.unwrap();
    info!(addr = %endpoint.read().unwrap().addr, ?mode, "listening");

    let mut last = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let total = received.load(Ordering::Relaxed);
                if total != last {
                    info!(connections = transport.connection_count(), "received {} MB", total as f64 / 1e6);
                    last = total;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = stop.notified() => break,
        }
    }

    info!("shutting down");
    if let Err(err) = transport.stop().await {
        warn!(error = %err, "transport stopped with an error");
    }
}
