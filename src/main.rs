use clap::Parser;
use color_eyre::eyre::WrapErr;
use std::{net::IpAddr, time::Duration};
use tokio::io::BufReader;
use tracing::info;

use rustbully::console::Console;
use rustbully_node::{
    codec::check_identity,
    msg::{BULLY_TIME, HEARTBEAT_INTERVAL, NODE_PORT},
    Node, NodeConfig,
};

/// Self-organizing peer node with bully leader election.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    #[arg(long, short = 'p', default_value_t = NODE_PORT)]
    port: u16,

    /// Node identity. Random when not given.
    #[arg(long, value_parser = parse_identity)]
    identity: Option<String>,

    /// Election timeout in milliseconds.
    #[arg(long, default_value_t = BULLY_TIME.as_millis() as u64)]
    bully_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = HEARTBEAT_INTERVAL.as_millis() as u64)]
    heartbeat_ms: u64,

    /// Report to tokio-console instead of logging to stderr.
    #[arg(long)]
    tokio_console: bool,
}

impl Args {
    fn config(&self) -> NodeConfig {
        let mut config = NodeConfig {
            listen_addr: (self.bind, self.port).into(),
            ..NodeConfig::default()
        }
        .with_timing(
            Duration::from_millis(self.bully_ms),
            Duration::from_millis(self.heartbeat_ms),
        );
        if let Some(identity) = &self.identity {
            config = config.with_identity(identity.clone());
        }
        config
    }
}

fn parse_identity(identity: &str) -> Result<String, String> {
    check_identity(identity)
        .map(|()| identity.to_string())
        .map_err(|e| e.to_string())
}

fn init_tracing(tokio_console: bool) {
    if tokio_console {
        console_subscriber::init();
        return;
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(args.tokio_console);

    let config = args.config();
    let listen_addr = config.listen_addr;
    let node = Node::spawn(config)
        .await
        .wrap_err_with(|| format!("failed to start node on {listen_addr}"))?;
    info!("Console initiated. Type something");

    let stdin = BufReader::new(tokio::io::stdin());
    Console::new(node.clone())
        .run(stdin, &mut std::io::stdout())
        .await
        .wrap_err("console failed")?;

    // Established links outlive the console.
    info!("console closed, serving existing links until interrupted");
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.wrap_err("failed to wait for ctrl-c")?,
        _ = node.stopped() => {}
    }
    Ok(())
}
