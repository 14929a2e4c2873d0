use clap::Parser;
use clap_derive::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::anyhow;
use bytes::Bytes;
use homa_transport::buffer_pages::BufferPageSet;
use homa_transport::config::HomaConfig;
use homa_transport::sim::SimNetwork;
use homa_transport::socket::HomaSocket;
use tracing::{info, Level};

/// Sends requests from a client socket to a server socket that echoes them back
#[derive(Parser)]
struct Args {
    /// use the Homa kernel module instead of the in-process simulation
    #[clap(long, default_value_t = false)]
    kernel: bool,

    #[clap(long, default_value = "127.0.0.1:4000")]
    server_address: String,

    #[clap(long, default_value_t = 1000)]
    count: u64,

    /// payload size in bytes
    #[clap(long, default_value_t = 100)]
    size: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let server_addr: SocketAddr = args.server_address.parse()?;
    let client_addr = SocketAddr::new(server_addr.ip(), 0);
    let config = HomaConfig::default_config();

    let (server, client) = if args.kernel {
        (HomaSocket::open(server_addr, &config)?, HomaSocket::open(client_addr, &config)?)
    }
    else {
        let network = SimNetwork::new();
        (HomaSocket::open_simulated(&network, server_addr, &config)?, HomaSocket::open_simulated(&network, client_addr, &config)?)
    };
    let server = Arc::new(server);
    let client = Arc::new(client);

    let server_task = tokio::spawn(run_server(server.clone(), args.count));

    let payload = Bytes::from((0..args.size).map(|i| i as u8).collect::<Vec<_>>());
    let mut recycle = BufferPageSet::new();
    let start = Instant::now();
    for cookie in 0..args.count {
        let sent = client.send_request_async(server_addr, vec![payload.clone()], cookie).await?;
        let reply = client.receive_reply_async(sent.id, &recycle).await?;
        if reply.completion_cookie != cookie || reply.bytes_transferred != payload.len() {
            return Err(anyhow!("unexpected reply {:?} for request {}", reply, cookie));
        }
        recycle = reply.pages;
    }
    let elapsed = start.elapsed();

    server_task.await??;
    info!("{} round trips of {} bytes in {:?} ({:?} per round trip)", args.count, args.size, elapsed, per_round_trip(elapsed, args.count));
    Ok(())
}

fn per_round_trip(elapsed: Duration, count: u64) -> Duration {
    let nanos = elapsed.as_nanos() / u128::from(count.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

async fn run_server(socket: Arc<HomaSocket>, count: u64) -> anyhow::Result<()> {
    let mut recycle = BufferPageSet::new();
    for _ in 0..count {
        let request = socket.receive_request_async(&recycle).await?;
        let peer = request.peer.ok_or_else(|| anyhow!("request without peer address"))?;
        let data = socket.region().read_message(&request.pages, request.bytes_transferred);
        socket.send_reply_async(peer, vec![Bytes::from(data)], request.id).await?;
        recycle = request.pages;
    }
    Ok(())
}
