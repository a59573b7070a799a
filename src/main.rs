use clap::{Arg, ArgMatches, Command};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use haraft::cli::{self, AdminAction};
use haraft::consensus::RpcRequest;
use haraft::network::TcpTransport;
use haraft::{Config, HaraftError, Node, Result};

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("haraft")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Leader election and failover control for MySQL replication groups")
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("Log filter, overrides the config file (RUST_LOG wins over both)")
                .global(true)
                .required(false),
        )
        .subcommand(
            Command::new("serve").about("Run a cluster node").arg(
                Arg::new("config")
                    .long("config")
                    .short('c')
                    .help("Path to the node's TOML configuration")
                    .required(true),
            ),
        )
        .subcommand(
            Command::new("ha")
                .about("Send an HA control request to each listed node")
                .arg(
                    Arg::new("action")
                        .help("enable, disable or trytoleader")
                        .required(true),
                )
                .arg(nodes_arg())
                .arg(timeout_arg()),
        )
        .subcommand(
            Command::new("status")
                .about("Print each listed node's status")
                .arg(nodes_arg())
                .arg(timeout_arg()),
        )
        .get_matches();

    let result = match matches.subcommand() {
        Some(("serve", sub)) => serve(&matches, sub).await,
        Some(("ha", sub)) => {
            init_tracing(&matches, "warn");
            ha(sub).await
        }
        Some(("status", sub)) => {
            init_tracing(&matches, "warn");
            status(sub).await
        }
        _ => Err(HaraftError::InvalidConfig("unknown command".to_string())),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn nodes_arg() -> Arg {
    Arg::new("nodes")
        .long("nodes")
        .help("Comma-separated list of node RPC addresses")
        .required(true)
}

fn timeout_arg() -> Arg {
    Arg::new("timeout-ms")
        .long("timeout-ms")
        .help("Per-node request deadline in milliseconds")
        .default_value("3000")
}

fn init_tracing(matches: &ArgMatches, default_level: &str) {
    let level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or(default_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn timeout(matches: &ArgMatches) -> Result<Duration> {
    let raw = matches
        .get_one::<String>("timeout-ms")
        .map(String::as_str)
        .unwrap_or("3000");
    let millis = raw
        .parse::<u64>()
        .map_err(|e| HaraftError::InvalidConfig(format!("Invalid timeout: {}", e)))?;
    Ok(Duration::from_millis(millis))
}

fn nodes(matches: &ArgMatches) -> Result<Vec<haraft::consensus::NodeId>> {
    let list = matches
        .get_one::<String>("nodes")
        .ok_or_else(|| HaraftError::InvalidConfig("--nodes is required".to_string()))?;
    cli::parse_nodes(list)
}

async fn serve(matches: &ArgMatches, sub: &ArgMatches) -> Result<bool> {
    let path = sub
        .get_one::<String>("config")
        .ok_or_else(|| HaraftError::InvalidConfig("--config is required".to_string()))?;
    let config = Config::load(path)?;

    let level = config.log.level.clone();
    init_tracing(matches, &level);
    info!("Starting haraft node {}", config.raft.address);

    let node = Node::new(config).await?;
    node.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            futures::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(true)
}

async fn ha(sub: &ArgMatches) -> Result<bool> {
    let action: AdminAction = sub
        .get_one::<String>("action")
        .ok_or_else(|| HaraftError::InvalidConfig("action is required".to_string()))?
        .parse()?;
    run_fan_out(sub, action.request()).await
}

async fn status(sub: &ArgMatches) -> Result<bool> {
    run_fan_out(sub, RpcRequest::Status).await
}

async fn run_fan_out(sub: &ArgMatches, request: RpcRequest) -> Result<bool> {
    let nodes = nodes(sub)?;
    let timeout = timeout(sub)?;
    let transport = TcpTransport::new(timeout);

    let outcomes = cli::fan_out(&transport, &nodes, request, timeout).await;
    let mut all_ok = true;
    for outcome in &outcomes {
        println!("{}", outcome);
        all_ok &= outcome.succeeded();
    }
    Ok(all_ok)
}
