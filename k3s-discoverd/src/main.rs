mod clock;
mod cluster;
mod config;
mod error;
mod events;
mod exec;
mod mdns;
mod orchestrator;
mod token;
#[cfg(test)]
mod testing;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mdns_sd::ServiceDaemon;
use tokio_util::sync::CancellationToken;
use shared::types::Role;
use crate::clock::{Clock, TokioClock};
use crate::cluster::elector::CommandElector;
use crate::cluster::installer::CommandInstaller;
use crate::cluster::probe::CommandProbe;
use crate::config::{outbound_ipv4, Backend, Config};
use crate::events::{EventSink, TracingSink};
use crate::exec::{CommandRunner, TokioRunner};
use crate::mdns::advertise::{render_service_xml, Advertisement, Advertiser, AvahiAdvertiser, NativeAdvertiser};
use crate::mdns::query::{QueryEngine, QueryMode, QueryOptions};
use crate::mdns::selfcheck::{SelfCheckOutcome, Verifier};
use crate::mdns::source::{AvahiSource, DiscoverySource, NativeSource, StaticSource};
use crate::orchestrator::{selfcheck_request, Collaborators, Orchestrator, RunOutcome, EXIT_DEFERRED};

#[derive(Debug, Parser)]
#[command(name = "k3s-discoverd", version, about = "mDNS discovery, leader election and join coordinator for k3s")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover, elect and join (default)
    Run,
    /// Print discovered hosts: server-first, server-hosts, server-count, bootstrap-hosts, bootstrap-leaders
    Query { mode: QueryMode },
    /// Confirm this node's advertisement is visible and print the record as JSON
    Selfcheck {
        #[arg(long, default_value = "server")]
        role: Role,
        /// Expected host; defaults to this node
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        require_ipv4: bool,
    },
    /// Print the Avahi service file for this node
    RenderService {
        role: Role,
        #[arg(long)]
        port: Option<u16>,
        /// Extra TXT entries as key=value
        txt: Vec<String>,
    },
}

/// Discovery source plus the matching advertiser
struct Transport {
    source: Arc<dyn DiscoverySource>,
    advertiser: Arc<dyn Advertiser>,
    daemon: Option<ServiceDaemon>,
}

fn transport(config: &Config, runner: Arc<dyn CommandRunner>) -> Result<Transport> {
    let discovery = &config.discovery;
    if let Some(fixture) = &discovery.fixture_file {
        tracing::info!("Reading discovery records from fixture {}", fixture.display());
        return Ok(Transport {
            source: Arc::new(StaticSource::from_path(fixture)),
            advertiser: Arc::new(AvahiAdvertiser::new(&config.tools.avahi_service_dir, &config.cluster.name, &config.cluster.env)),
            daemon: None,
        });
    }

    match discovery.backend {
        Backend::Avahi => Ok(Transport {
            source: Arc::new(AvahiSource::new(runner, discovery.interface.clone(), config.query_timeout(), &TracingSink)),
            advertiser: Arc::new(AvahiAdvertiser::new(&config.tools.avahi_service_dir, &config.cluster.name, &config.cluster.env)),
            daemon: None,
        }),
        Backend::Native => {
            let source = NativeSource::new(discovery.interface.as_deref(), config.query_timeout())
                .context("Failed to start mDNS daemon")?;
            let daemon = source.daemon().clone();
            Ok(Transport {
                advertiser: Arc::new(NativeAdvertiser::new(daemon.clone())),
                source: Arc::new(source),
                daemon: Some(daemon),
            })
        }
    }
}

fn engine(config: &Config, source: Arc<dyn DiscoverySource>, clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> QueryEngine {
    QueryEngine::new(
        source,
        clock,
        events,
        QueryOptions {
            cluster: config.cluster.name.clone(),
            env: config.cluster.env.clone(),
            retry: config.query_retry(),
        },
    )
}

async fn run_coordinator(config: &Config, transport: &Transport, runner: Arc<dyn CommandRunner>) -> Result<i32> {
    let tools = &config.tools;
    let collaborators = Collaborators {
        source: transport.source.clone(),
        advertiser: transport.advertiser.clone(),
        elector: Arc::new(CommandElector::new(
            runner.clone(),
            &tools.elect_leader_bin,
            &config.cluster.name,
            &config.cluster.env,
            config.cluster.servers,
            config.query_timeout(),
        )),
        probe: Arc::new(CommandProbe::new(
            runner.clone(),
            &tools.api_ready_bin,
            Some(Duration::from_secs(tools.api_ready_timeout_secs)),
        )),
        installer: Arc::new(CommandInstaller::new(
            runner,
            &tools.install_bin,
            Some(Duration::from_secs(tools.install_timeout_secs)),
        )),
        clock: Arc::new(TokioClock),
        events: Arc::new(TracingSink),
    };

    let mut orchestrator = Orchestrator::new(config, collaborators)?;
    tracing::info!("Coordinating {} as {}", config.cluster.name, orchestrator.host());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal_cancel.cancel();
        }
    });

    tokio::select! {
        outcome = orchestrator.run() => {
            let outcome = RunOutcome::settle(outcome)?;
            match outcome.url() {
                Some(url) => tracing::info!("Run finished: {:?}; API at {}", outcome, url),
                None => tracing::info!("Run finished: {:?}; run again to resume", outcome),
            }
            Ok(outcome.exit_code())
        }
        _ = cancel.cancelled() => {
            tracing::warn!("Interrupted before the node joined; run again to resume");
            Ok(EXIT_DEFERRED)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let vars: HashMap<String, String> = std::env::vars().collect();
    let mut config = Config::load(cli.config.as_deref(), &vars)?;
    if let Some(path) = &cli.config {
        tracing::info!("Loaded config from {}", path.display());
    }
    if config.cluster.node_ipv4.is_none() {
        config.cluster.node_ipv4 = outbound_ipv4();
        tracing::debug!("Detected node IPv4 {:?}", config.cluster.node_ipv4);
    }

    let command = cli.command.unwrap_or(Command::Run);
    if let Command::RenderService { role, port, txt } = &command {
        let port = port.unwrap_or(config.cluster.api_port);
        let host = config.hostname();
        let mut ad = match role {
            Role::Bootstrap => Advertisement::bootstrap(&config.cluster.name, &config.cluster.env, &host, port),
            Role::Server => Advertisement::server(&config.cluster.name, &config.cluster.env, &host, port),
        }
        .with_addresses(config.cluster.node_ipv4, config.cluster.node_ipv6);
        for entry in txt {
            let (key, value) = entry
                .split_once('=')
                .with_context(|| format!("TXT entry {:?} is not key=value", entry))?;
            ad.extra.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
        print!("{}", render_service_xml(&ad));
        return Ok(0);
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(TokioRunner);
    let transport = transport(&config, runner.clone())?;
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);

    let code = match command {
        Command::Run => run_coordinator(&config, &transport, runner).await?,
        Command::Query { mode } => {
            for line in engine(&config, transport.source.clone(), clock, events).query(mode).await {
                println!("{}", line);
            }
            0
        }
        Command::Selfcheck { role, host, require_ipv4 } => {
            let host = host.unwrap_or_else(|| config.hostname());
            let mut request = selfcheck_request(&config, role, &host);
            request.require_ipv4 |= require_ipv4;
            let verifier = Verifier::new(transport.source.clone(), clock, events, config.selfcheck_retry(), config.selfcheck.skip);
            match verifier.verify(&request).await? {
                SelfCheckOutcome::Confirmed(record) => {
                    println!("{}", serde_json::to_string_pretty(&record).context("Failed to serialize record")?);
                }
                SelfCheckOutcome::Skipped => println!("{}", serde_json::json!({ "outcome": "skipped" })),
            }
            0
        }
        Command::RenderService { .. } => 0,
    };

    if let Some(daemon) = transport.daemon {
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }
    Ok(code)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries query and self-check output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("k3s_discoverd=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}
