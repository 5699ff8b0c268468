// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runs every strategy on an in-process cluster over simulated links.
//!
//! Nodes are spread round-robin over a few regions, links within a region
//! are fast and links across regions slow, so the latency-aware strategies
//! have something to optimize.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use fastrace::collector::{Config, ConsoleReporter};
use fastrace::prelude::*;
use log::{info, warn};
use netdiag::network::SimulatedNetworkCore;
use netdiag::report::DisseminationSummary;
use netdiag::{Engine, StrategyCode, create_local_cluster, logging};

/// One-way latency between nodes of the same region.
const INTRA_REGION: Duration = Duration::from_millis(2);
/// One-way latencies between regions, in milliseconds.
const REGION_LATENCIES: [[u64; 4]; 4] = [
    [0, 40, 80, 120],
    [40, 0, 60, 100],
    [80, 60, 0, 70],
    [120, 100, 70, 0],
];
/// How long to wait for all nodes to confirm a graph.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of nodes in the cluster.
    #[arg(long, default_value_t = 24)]
    nodes: usize,
    /// Payload size in bytes.
    #[arg(long, default_value_t = 100_000)]
    size: usize,
    /// Split payloads into chunks, as on datagram links.
    #[arg(long)]
    datagram: bool,
    /// Prints finished spans to stdout.
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // enable fancy `color_eyre` error messages
    color_eyre::install()?;

    let args = Args::parse();
    if args.trace {
        fastrace::set_reporter(ConsoleReporter, Config::default());
    }
    logging::enable_logforth();

    let core = SimulatedNetworkCore::default()
        .with_default_latency(INTRA_REGION)
        .with_datagram_mode(args.datagram);
    for a in 0..args.nodes {
        for b in (a + 1)..args.nodes {
            let (ra, rb) = (a % REGION_LATENCIES.len(), b % REGION_LATENCIES.len());
            if ra != rb {
                core.set_latency(a, b, Duration::from_millis(REGION_LATENCIES[ra][rb]));
            }
        }
    }

    let root = Span::root("local cluster", SpanContext::random());
    let res = run(&args, &core).in_span(root).await;
    fastrace::flush();
    res
}

async fn run(args: &Args, core: &SimulatedNetworkCore) -> Result<()> {
    let engines = create_local_cluster(args.nodes, core);
    let origin = Arc::clone(&engines[0]);
    let names = origin.strategy_names().to_vec();

    let warm_up = origin.warm_up(args.size, 0).await?;
    info!("warm up: {}", serde_json::to_string(&warm_up.summary())?);

    let mut summaries = Vec::with_capacity(names.len());
    for (code, name) in names.iter().enumerate() {
        let code = code as StrategyCode;
        prepare_graph(&origin, &engines, code).await?;
        match origin.disseminate(code, args.size, 0).await {
            Ok(result) => summaries.push((*name, result.summary())),
            Err(err) => warn!("strategy {code} ({name}) failed: {err}"),
        }
    }

    for (name, summary) in &summaries {
        print_summary(name, summary);
    }
    for engine in &engines {
        engine.shutdown();
    }
    Ok(())
}

/// Exchanges latencies for `code` and waits until every node has its graph.
///
/// Strategies without a graph are ready right away.
async fn prepare_graph(origin: &Arc<Engine>, engines: &[Arc<Engine>], code: StrategyCode) -> Result<()> {
    if all_ready(engines, code)? {
        return Ok(());
    }
    origin.trigger_latency_broadcast(code).await?;
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    while !all_ready(engines, code)? {
        if tokio::time::Instant::now() > deadline {
            warn!("graph of strategy {code} not ready on all nodes");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

fn all_ready(engines: &[Arc<Engine>], code: StrategyCode) -> Result<bool> {
    for engine in engines {
        if !engine.is_graph_ready(code)?.not_ready.is_empty() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn print_summary(name: &str, summary: &DisseminationSummary) {
    let ms = |d: Option<Duration>| d.map_or_else(|| "-".to_owned(), |d| format!("{:.1}", d.as_secs_f64() * 1e3));
    println!(
        "{name:<52} received {:>3} full {:>3} timeouts {:>3} | min {:>7} median {:>7} 2/3 {:>7} max {:>7} ms",
        summary.received,
        summary.full,
        summary.timed_out,
        ms(summary.min),
        ms(summary.median),
        ms(summary.two_thirds),
        ms(summary.max),
    );
}
