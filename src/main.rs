use std::str::FromStr;

use clap::Parser;
use n0_error::Result;
use tinyforward::{Authority, Proxy, ProxyOpts};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(about = "A transparent/forward HTTP proxy")]
struct Cli {
    /// Address to listen on.
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on.
    #[clap(short, long, env = "PORT", default_value_t = 5560)]
    port: u16,
    /// Send all traffic to this upstream ("host:port") instead of the
    /// destination each request names.
    #[clap(short, long, env = "UPSTREAM")]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut opts = ProxyOpts::default();
    if let Some(upstream) = &cli.upstream {
        // the override must name an explicit port
        opts = opts.upstream(Authority::from_str(upstream)?);
    }
    #[cfg(target_os = "linux")]
    {
        opts = opts.original_dst(tinyforward::SoOriginalDst);
    }

    let listener = TcpListener::bind(format!("{}:{}", cli.host, cli.port)).await?;
    println!("listening on {}", listener.local_addr()?);

    let proxy = Proxy::new(opts);
    tokio::select! {
        res = proxy.run(listener) => res?,
        _ = tokio::signal::ctrl_c() => proxy.shutdown().await,
    }
    Ok(())
}
