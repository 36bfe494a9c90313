//! `reqfan-probe`: a minimal client for poking at a running dispatcher.
//!
//! Connects, sends one or more packets back-to-back (to exercise
//! pipelining), and prints each response as it arrives in whatever order
//! the dispatcher delivers them.

use std::str;

use bytes::Bytes;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use reqfan::DEFAULT_PORT;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Parser, Debug)]
#[clap(name = "reqfan-probe", version, author, about = "Send packets to a reqfan dispatcher")]
struct Cli {
    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Packet payload to send. May be given more than once to pipeline
    /// several requests over one connection.
    #[clap(required = true)]
    data: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> reqfan::Result<()> {
    tracing_subscriber::fmt::try_init()?;
    let cli = Cli::parse();

    let addr = format!("{}:{}", cli.host, cli.port);
    let stream = TcpStream::connect(&addr).await?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    for payload in &cli.data {
        framed.send(Bytes::from(payload.clone())).await?;
    }

    for _ in 0..cli.data.len() {
        match framed.next().await {
            Some(Ok(response)) => match str::from_utf8(&response) {
                Ok(text) => println!("{}", text),
                Err(_) => println!("{:?}", response.as_ref()),
            },
            Some(Err(err)) => {
                eprintln!("read failed: {}", err);
                break;
            }
            None => {
                eprintln!("connection closed before all responses arrived");
                break;
            }
        }
    }

    Ok(())
}
