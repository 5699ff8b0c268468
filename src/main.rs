// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::Context;
use fastrace::collector::{Config, ConsoleReporter};
use fastrace::prelude::*;
use log::{debug, info, warn};
use netdiag::config::{NetworkMode, NodeConfig, generate_cluster_configs};
use netdiag::latency::{LatencyType, TcpConnectSampler};
use netdiag::network::{TcpConnection, TcpNetwork};
use netdiag::{Engine, PeerId, StrategyCode, StrategyRegistry, logging};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Delay between attempts to dial a peer that is not up yet.
const DIAL_RETRY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file of this node.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Writes one config file per address and exits.
    ///
    /// Takes the base name of the files, they are named `{base}_{id}.toml`.
    #[arg(long, requires = "addresses")]
    generate_config_files: Option<String>,
    /// Addresses of all nodes, used with `--generate-config-files`.
    #[arg(long, value_delimiter = ',')]
    addresses: Vec<SocketAddr>,
    /// Fixed latency servers, used with `--generate-config-files`.
    #[arg(long, value_delimiter = ',')]
    fixed_servers: Vec<SocketAddr>,
    /// Network mode, used with `--generate-config-files`.
    #[arg(long, value_enum, default_value_t = Mode::Tcp)]
    network: Mode,
    /// Prints finished spans to stdout.
    #[arg(long)]
    trace: bool,
    /// Logs timestamps and full module paths.
    #[arg(long)]
    detailed_log: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Tcp,
    Datagram,
}

impl From<Mode> for NetworkMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Tcp => Self::Tcp,
            Mode::Datagram => Self::Datagram,
        }
    }
}

/// One line of console input.
#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists all strategies with their codes.
    Strategies,
    /// Lists the connected peers.
    Peers,
    /// Disseminates random data with a strategy.
    Disseminate {
        strategy: StrategyCode,
        size: usize,
        /// Number of target peers, 0 for all.
        #[arg(default_value_t = 0)]
        max_peers: usize,
        /// Prints all individual reports instead of a summary.
        #[arg(long)]
        full: bool,
    },
    /// Runs a broadcast to warm up connections.
    WarmUp {
        size: usize,
        #[arg(default_value_t = 0)]
        max_peers: usize,
    },
    /// Shares latencies for a strategy and asks all peers to do the same.
    Trigger { strategy: StrategyCode },
    /// Constructs the graph of a strategy from the current latency matrix.
    Construct {
        strategy: StrategyCode,
        #[arg(default_value_t = 0)]
        max_peers: usize,
    },
    /// Shows which peers confirmed their graph for a strategy.
    Ready { strategy: StrategyCode },
    /// Prints the latency matrix.
    Matrix {
        #[arg(long)]
        fixed: bool,
    },
    /// Measures the round-trip time to a peer.
    Ping { peer: PeerId },
    /// Sends random data to a peer.
    Send { peer: PeerId, size: usize },
    /// Asks a peer to retune its socket buffers.
    Socket {
        peer: PeerId,
        buffer_size: u64,
        #[arg(long)]
        reset: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // enable fancy `color_eyre` error messages
    color_eyre::install()?;

    let args = Args::parse();
    if args.trace {
        fastrace::set_reporter(ConsoleReporter, Config::default());
    }
    if args.detailed_log {
        logging::enable_logforth_detailed();
    } else {
        logging::enable_logforth();
    }

    if let Some(base) = &args.generate_config_files {
        return write_config_files(base, &args).await;
    }
    let Some(path) = args.config else {
        color_eyre::eyre::bail!("either --config or --generate-config-files is required");
    };
    let config = NodeConfig::from_file(&path)
        .with_context(|| format!("Can not load config {}", path.display()))?;

    let root_span = Span::root(format!("node {}", config.id), SpanContext::random());
    let cancel_token = CancellationToken::new();
    let node = tokio::spawn(run_node(config, cancel_token.clone()).in_span(root_span));

    tokio::select! {
        res = node => res??,
        res = tokio::signal::ctrl_c() => {
            res?;
            warn!("shutting down node");
            cancel_token.cancel();
        }
    }

    fastrace::flush();
    Ok(())
}

async fn write_config_files(base: &str, args: &Args) -> Result<()> {
    let configs = generate_cluster_configs(
        &args.addresses,
        &args.fixed_servers,
        args.network.into(),
    );
    for config in configs {
        let contents = config.to_toml_string()?;
        let path = format!("{base}_{}.toml", config.id);
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_data().await?;
        info!("wrote {path}");
    }
    Ok(())
}

async fn run_node(config: NodeConfig, cancel_token: CancellationToken) -> Result<()> {
    let datagram = config.network.is_datagram();
    let listen = config.listen_address()?;
    let network = TcpNetwork::bind(listen, datagram)
        .await
        .context("Can not bind listener")?;
    let engine = Engine::new(
        config.engine_config(),
        &StrategyRegistry::default(),
        Arc::new(TcpConnectSampler::default()),
    );
    info!(
        "node {} listening on {}, {} peers",
        config.id,
        listen,
        config.peers.len()
    );

    tokio::spawn(accept_loop(network, Arc::clone(&engine)));
    // lower indices are dialed, higher indices dial us
    for (id, &address) in config.peers.iter().enumerate().take(config.id) {
        tokio::spawn(dial(Arc::clone(&engine), id, address, datagram));
    }

    tokio::select! {
        res = console(Arc::clone(&engine)) => res?,
        () = cancel_token.cancelled() => {}
    }
    engine.shutdown();
    Ok(())
}

async fn accept_loop(network: TcpNetwork, engine: Arc<Engine>) {
    loop {
        let conn = match network.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("accepting connection failed: {err}");
                continue;
            }
        };
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let remote = conn.remote_addr();
            let (id, conn) = match TcpNetwork::handshake(conn).await {
                Ok(res) => res,
                Err(err) => {
                    warn!("handshake with {remote} failed: {err}");
                    return;
                }
            };
            match engine.add_peer(id, Arc::new(conn)) {
                Ok(_) => info!("peer {id} connected from {remote}"),
                Err(err) => warn!("rejecting connection from {remote}: {err}"),
            }
        });
    }
}

async fn dial(engine: Arc<Engine>, id: PeerId, address: SocketAddr, datagram: bool) {
    let conn = loop {
        match TcpConnection::connect(address, engine.id(), datagram).await {
            Ok(conn) => break conn,
            Err(err) => {
                debug!("dialing peer {id} at {address} failed: {err}");
                tokio::time::sleep(DIAL_RETRY).await;
            }
        }
    };
    match engine.add_peer(id, Arc::new(conn)) {
        Ok(_) => info!("connected to peer {id} at {address}"),
        Err(err) => warn!("adding peer {id} failed: {err}"),
    }
}

/// Reads commands from stdin until it is closed.
async fn console(engine: Arc<Engine>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<_> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let command = match ConsoleLine::try_parse_from(words) {
            Ok(parsed) => parsed.command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        let span = Span::root(format!("{command:?}"), SpanContext::random());
        match run_command(&engine, command).in_span(span).await {
            Ok(output) => println!("{output}"),
            Err(err) => println!("error: {err:#}"),
        }
    }
    Ok(())
}

async fn run_command(engine: &Arc<Engine>, command: Command) -> Result<String> {
    match command {
        Command::Strategies => {
            let names: Vec<_> = engine.strategy_names().iter().enumerate().collect();
            to_json(&names)
        }
        Command::Peers => to_json(&engine.connected_peers()),
        Command::Disseminate {
            strategy,
            size,
            max_peers,
            full,
        } => {
            let result = engine.disseminate(strategy, size, max_peers).await?;
            if full {
                to_json(&result)
            } else {
                to_json(&result.summary())
            }
        }
        Command::WarmUp { size, max_peers } => {
            let result = engine.warm_up(size, max_peers).await?;
            to_json(&result.summary())
        }
        Command::Trigger { strategy } => {
            engine.trigger_latency_broadcast(strategy).await?;
            Ok("triggered".to_owned())
        }
        Command::Construct {
            strategy,
            max_peers,
        } => {
            let construction = engine.construct_graph(strategy, max_peers).await?;
            Ok(format!("{construction:?}"))
        }
        Command::Ready { strategy } => to_json(&engine.is_graph_ready(strategy)?),
        Command::Matrix { fixed } => {
            let latency_type = if fixed {
                LatencyType::Fixed
            } else {
                LatencyType::Relative
            };
            to_json(&engine.latency_matrix(latency_type))
        }
        Command::Ping { peer } => to_json(&engine.ping_peer(peer).await?),
        Command::Send { peer, size } => to_json(&engine.send_data(peer, size).await?),
        Command::Socket {
            peer,
            buffer_size,
            reset,
        } => {
            engine.update_tcp_socket(peer, buffer_size, reset).await?;
            Ok("sent".to_owned())
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
