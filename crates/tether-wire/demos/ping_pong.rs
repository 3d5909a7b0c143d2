//! Two endpoints over loopback TCP: a plain call and a callback round trip.
//!
//! Run with `RUST_LOG=debug` to watch the routing. An optional first argument
//! names a TOML file with endpoint settings.

use std::path::PathBuf;
use tether_types::config::load_config;
use tether_wire::{handler_fn, Call, CallOptions, Endpoint, Fault, Function, StreamTransport, Value};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .map(|path| load_config(&path))
        .unwrap_or_default();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (client_stream, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (server_stream, _) = accepted?;

    let server = Endpoint::builder()
        .config(config.clone())
        .handler(
            "ping",
            handler_fn(|call: Call| async move {
                let who = call
                    .arg(0)
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "stranger".to_string());
                Ok(Value::from(format!("pong, {who}")))
            }),
        )
        .handler(
            "countdown",
            handler_fn(|call: Call| async move {
                let from = call.f64_arg(0)? as i64;
                let tick = call
                    .arg(1)
                    .and_then(|v| v.as_remote().cloned())
                    .ok_or_else(|| Fault::invalid_args("expected a callback"))?;
                for n in (1..=from).rev() {
                    tick.call(vec![n], CallOptions::default())
                        .await
                        .map_err(|e| Fault::new("callback_failed", e.to_string()))?;
                }
                Ok(Value::from("liftoff"))
            }),
        )
        .spawn(StreamTransport::tcp(server_stream, config.max_frame_bytes));
    let client = Endpoint::builder()
        .config(config.clone())
        .spawn(StreamTransport::tcp(client_stream?, config.max_frame_bytes));

    let reply = client
        .call("ping", vec!["demo"], CallOptions::default())
        .await?;
    info!(reply = ?reply.as_str(), "ping");

    let tick = Function::from_fn(|call: Call| async move {
        info!(n = ?call.arg(0).and_then(|v| v.as_i64()), "tick");
        Ok(Value::Null)
    });
    let done = client
        .call(
            "countdown",
            Value::list([Value::from(3), Value::from(tick)]),
            CallOptions::default(),
        )
        .await?;
    info!(
        result = ?done.as_str(),
        transient = client.registry().transient_count(),
        handlers = server.registry().len(),
        "countdown finished"
    );

    client.close();
    Ok(())
}
