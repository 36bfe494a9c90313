//! `reqfand`: the dispatcher daemon.
//!
//! 1. Parses command-line arguments.
//! 2. Binds the configured listening sockets.
//! 3. Constructs an upstream `Queue` -- either a real `TcpUpstreamQueue` or,
//!    for local smoke-testing, the in-process `EchoQueue`.
//! 4. Constructs the `Dispatcher` and drives it to completion, wiring
//!    `ctrl_c()` to a graceful shutdown.

use std::sync::Arc;

use clap::Parser;
use reqfan::queue::{EchoQueue, TcpUpstreamQueue};
use reqfan::{Dispatcher, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

#[cfg(feature = "otel")]
use opentelemetry::global;
#[cfg(feature = "otel")]
use opentelemetry::sdk::trace as sdktrace;
#[cfg(feature = "otel")]
use opentelemetry_aws::trace::XrayPropagator;
#[cfg(feature = "otel")]
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter};

#[derive(Parser, Debug)]
#[clap(
    name = "reqfand",
    version,
    author,
    about = "A connection-multiplexing request dispatcher"
)]
struct Cli {
    /// Address(es) to listen on for client connections. May be given more
    /// than once to bind multiple listeners.
    #[clap(long = "listen", default_value = "127.0.0.1:7878")]
    listen: Vec<String>,

    /// Maximum number of concurrently active client connections.
    #[clap(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Address of the real upstream server to forward requests to. When
    /// omitted, requests are served by an in-process echo queue instead,
    /// which is useful for local smoke-testing without a real backend.
    #[clap(long)]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() -> reqfan::Result<()> {
    set_up_logging()?;
    let cli = Cli::parse();

    let mut listeners = Vec::with_capacity(cli.listen.len());
    for addr in &cli.listen {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening");
        listeners.push(listener);
    }

    match cli.upstream {
        Some(addr) => {
            info!(upstream = %addr, "forwarding requests to a real upstream");
            let queue = TcpUpstreamQueue::connect(addr).await?;
            run(listeners, queue, cli.max_connections).await
        }
        None => {
            info!("no --upstream given; echoing requests back as responses");
            let queue = Arc::new(EchoQueue::new());
            run(listeners, queue, cli.max_connections).await
        }
    }
}

async fn run<Q: reqfan::Queue>(
    listeners: Vec<TcpListener>,
    queue: Arc<Q>,
    max_connections: usize,
) -> reqfan::Result<()> {
    let mut dispatcher = Dispatcher::construct(listeners, queue, max_connections)?;

    tokio::select! {
        res = dispatcher.run() => {
            if let Err(err) = res {
                error!(cause = %err, "dispatcher failed");
            }
        }
        _ = signal::ctrl_c() => {
            info!("received ctrl-c; shutting down");
            dispatcher.shutdown();
            if let Err(err) = dispatcher.run().await {
                error!(cause = %err, "dispatcher failed during shutdown drain");
            }
        }
    }

    Ok(())
}

#[cfg(not(feature = "otel"))]
fn set_up_logging() -> reqfan::Result<()> {
    tracing_subscriber::fmt::try_init()
}

#[cfg(feature = "otel")]
fn set_up_logging() -> Result<(), TryInitError> {
    global::set_text_map_propagator(XrayPropagator::default());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(
            sdktrace::config()
                .with_sampler(sdktrace::Sampler::AlwaysOn)
                .with_id_generator(sdktrace::XrayIdGenerator::default()),
        )
        .install_simple()
        .expect("unable to initialize the OTLP pipeline");

    let opentelemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let filter = EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(opentelemetry)
        .with(filter)
        .with(fmt::Layer::default())
        .try_init()
}
