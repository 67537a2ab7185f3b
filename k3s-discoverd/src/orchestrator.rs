//! Per-node discovery, election and join state machine.
//!
//! One [`Orchestrator::run`] is one traversal of
//! `INIT -> DISCOVER_BOOTSTRAP -> ELECT -> {BECOME_LEADER | AWAIT_SERVER} -> JOIN -> READY`,
//! with a fail-open branch out of the two polling states. Every external
//! effect is idempotent so a restarted node simply runs again; a node that
//! failed open switches to the canonical server on its next run.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use shared::protocol::{fallback_host, DEFAULT_DOMAIN};
use shared::types::{same_host, Phase, Role, ServiceRecord};
use crate::clock::Clock;
use crate::cluster::elector::{Election, Elector};
use crate::cluster::installer::{InstallRequest, Installer, JoinMode};
use crate::cluster::probe::{ProbeTarget, ReadinessProbe};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::mdns::advertise::{Advertisement, Advertiser};
use crate::mdns::query::{select_server, QueryEngine, QueryMode, QueryOptions};
use crate::mdns::selfcheck::{SelfCheckRequest, Verifier};
use crate::mdns::source::DiscoverySource;

/// Everything the state machine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn DiscoverySource>,
    pub advertiser: Arc<dyn Advertiser>,
    pub elector: Arc<dyn Elector>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub installer: Arc<dyn Installer>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventSink>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// This node initialized the cluster
    Leader { url: String },
    /// Joined a discovered server
    Joined { url: String },
    /// Joined the deterministic fallback host
    FailOpenJoined { url: String },
    /// Gave up waiting for a server; safe to run again later
    Deferred { reason: String },
}

/// `EX_TEMPFAIL`: nothing went wrong, try again later
pub const EXIT_DEFERRED: i32 = 75;

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Deferred { .. } => EXIT_DEFERRED,
            _ => 0,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            RunOutcome::Leader { url } | RunOutcome::Joined { url } | RunOutcome::FailOpenJoined { url } => Some(url),
            RunOutcome::Deferred { .. } => None,
        }
    }

    /// Fold a run's result: an error that is not fatal leaves the node safe
    /// to run again, so it reads as deferred
    pub fn settle(result: Result<RunOutcome>) -> Result<RunOutcome> {
        match result {
            Err(e) if !e.is_fatal() => {
                tracing::warn!("Run stopped early: {}", e);
                Ok(RunOutcome::Deferred { reason: e.reason().to_string() })
            }
            other => other,
        }
    }
}

/// Where the discovery poll loop goes next
enum Next {
    Join(ServiceRecord),
    Done(RunOutcome),
    Elect,
}

struct FailOpenTracker {
    started: DateTime<Utc>,
    timeout: std::time::Duration,
}

pub struct Orchestrator {
    config: Config,
    host: String,
    c: Collaborators,
    engine: QueryEngine,
    verifier: Verifier,
    tracker: Option<FailOpenTracker>,
    candidacy: bool,
}

impl Orchestrator {
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let host = config.hostname();
        if host.is_empty() {
            return Err(Error::Config("cannot determine this node's host name; set SUGARKUBE_NODE_HOSTNAME".into()));
        }

        let engine = QueryEngine::new(
            collaborators.source.clone(),
            collaborators.clock.clone(),
            collaborators.events.clone(),
            QueryOptions {
                cluster: config.cluster.name.clone(),
                env: config.cluster.env.clone(),
                retry: config.query_retry(),
            },
        );
        let verifier = Verifier::new(
            collaborators.source.clone(),
            collaborators.clock.clone(),
            collaborators.events.clone(),
            config.selfcheck_retry(),
            config.selfcheck.skip,
        );

        Ok(Self {
            config: config.clone(),
            host,
            c: collaborators,
            engine,
            verifier,
            tracker: None,
            candidacy: false,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.emit(
            Event::info("discovery_start")
                .field("cluster", &self.config.cluster.name)
                .field("env", &self.config.cluster.env)
                .quoted("host", &self.host)
                .field("servers", self.config.cluster.servers),
        );

        if self.config.failopen_enabled() {
            let timeout = self.config.failopen_timeout();
            self.tracker = Some(FailOpenTracker { started: self.c.clock.now(), timeout });
            self.emit(Event::info("discovery_failopen_tracking_started").field("timeout", timeout.as_secs()));
        } else {
            tracing::info!("Fail-open disabled for env {}", self.config.cluster.env);
        }

        match self.discover_bootstrap().await? {
            Next::Join(record) => return self.join(record).await,
            Next::Done(outcome) => return Ok(outcome),
            Next::Elect => {}
        }

        if self.elect().await.winner {
            return self.become_leader().await;
        }
        self.await_server().await
    }

    fn emit(&self, event: Event) {
        self.c.events.emit(event);
    }

    fn others<'a>(&self, records: &'a [ServiceRecord]) -> Vec<&'a ServiceRecord> {
        records.iter().filter(|r| !same_host(&r.host, &self.host)).collect()
    }

    /// A server advertised by some other node
    fn pick_server(&self, records: &[ServiceRecord]) -> Option<ServiceRecord> {
        let others: Vec<ServiceRecord> = self.others(records).into_iter().cloned().collect();
        select_server(&others).cloned()
    }

    /// Any other node advertising a bootstrap or server role
    fn canonical_visible(&self, records: &[ServiceRecord]) -> bool {
        self.others(records).iter().any(|r| r.role().is_some())
    }

    fn select(&self, record: &ServiceRecord) {
        self.emit(
            Event::info("mdns_select")
                .quoted("host", &record.host)
                .field("port", record.port)
                .field("source", record.source),
        );
    }

    async fn discover_bootstrap(&mut self) -> Result<Next> {
        let attempts = self.config.discovery.attempts.max(1);
        for attempt in 1..=attempts {
            let records = self.engine.discover(QueryMode::ServerFirst).await;
            if let Some(server) = self.pick_server(&records) {
                self.select(&server);
                return Ok(Next::Join(server));
            }

            if !self.candidacy {
                self.advertise_candidacy().await;
            }

            let candidates = self.engine.discover(QueryMode::BootstrapLeaders).await;
            let competing: Vec<String> = self
                .others(&candidates)
                .into_iter()
                .filter(|r| r.is_bootstrap())
                .map(|r| r.host.clone())
                .collect();
            self.emit(
                Event::debug("discovery_poll")
                    .field("state", "discover_bootstrap")
                    .field("attempt", attempt)
                    .field("candidates", competing.len())
                    .field("hosts", competing.join(",")),
            );

            let seen = self.canonical_visible(&records) || !competing.is_empty();
            if let Some(outcome) = self.try_failopen(seen).await? {
                return Ok(Next::Done(outcome));
            }

            if attempt < attempts {
                self.c.clock.sleep(self.config.poll_interval()).await;
            }
        }
        Ok(Next::Elect)
    }

    /// This node's advertisement for `role`, carrying its configured addresses
    fn advertisement(&self, role: Role) -> Advertisement {
        let (cluster, env, port) = (&self.config.cluster.name, &self.config.cluster.env, self.config.cluster.api_port);
        let ad = match role {
            Role::Bootstrap => Advertisement::bootstrap(cluster, env, &self.host, port),
            Role::Server => Advertisement::server(cluster, env, &self.host, port),
        };
        ad.with_addresses(self.config.cluster.node_ipv4, self.config.cluster.node_ipv6)
    }

    async fn advertise_candidacy(&mut self) {
        let ad = self.advertisement(Role::Bootstrap);
        if self.publish(&ad).await {
            self.candidacy = true;
            self.self_check(&ad).await;
        }
    }

    /// Advertise `ad`; failures are logged and the run continues
    async fn publish(&self, ad: &Advertisement) -> bool {
        match self.c.advertiser.advertise(ad).await {
            Ok(()) => {
                self.emit(
                    Event::info("mdns_advertise")
                        .field("role", ad.role)
                        .quoted("instance", ad.instance())
                        .field("type", ad.service_type()),
                );
                true
            }
            Err(e) => {
                self.emit(Event::warn("mdns_advertise").field("role", ad.role).field("outcome", "fail").field("reason", e.reason()));
                tracing::warn!("Advertising {} failed: {}", ad.instance(), e);
                false
            }
        }
    }

    async fn self_check(&self, ad: &Advertisement) {
        let request = SelfCheckRequest {
            instance: ad.instance(),
            service_type: ad.service_type(),
            domain: DEFAULT_DOMAIN.to_string(),
            expected_host: Some(self.host.clone()),
            require_phase: Some(ad.phase),
            require_role: Some(ad.role),
            require_ipv4: self.config.selfcheck.require_ipv4,
        };
        if let Err(e) = self.verifier.verify(&request).await {
            tracing::warn!("{}; continuing", e);
        }
    }

    async fn elect(&self) -> Election {
        let election = match self.c.elector.elect().await {
            Ok(election) => election,
            Err(e) => {
                tracing::warn!("Leader election failed: {}", e);
                Election { winner: false, key: String::new() }
            }
        };
        self.emit(
            Event::info("election")
                .field("winner", if election.winner { "yes" } else { "no" })
                .field("key", &election.key),
        );
        election
    }

    async fn become_leader(&mut self) -> Result<RunOutcome> {
        // A server may have come up between the election and now
        let records = self.engine.discover(QueryMode::ServerFirst).await;
        if let Some(server) = self.pick_server(&records) {
            self.emit(Event::info("leader_claim_deferred").quoted("host", &server.host));
            self.select(&server);
            return self.join(server).await;
        }

        let request = InstallRequest {
            mode: JoinMode::ClusterInit,
            url: None,
            token: self.config.token.clone(),
            server_ip: None,
        };
        self.c.installer.install(&request).await?;

        let ad = self.advertisement(Role::Server);
        if self.publish(&ad).await {
            self.self_check(&ad).await;
        }

        let rivals: Vec<String> = self
            .others(&self.engine.discover(QueryMode::ServerFirst).await)
            .into_iter()
            .filter(|r| r.is_server())
            .map(|r| r.host.clone())
            .collect();
        if !rivals.is_empty() {
            let mut leaders = vec![self.host.clone()];
            leaders.extend(rivals);
            self.emit(Event::warn("election_ambiguous").field("leaders", leaders.join(",")));
            tracing::warn!("{}", Error::ElectionAmbiguous { leaders });
        }

        let url = format!("https://{}:{}", self.host, self.config.cluster.api_port);
        self.ready(JoinMode::ClusterInit, &url).await;
        Ok(RunOutcome::Leader { url })
    }

    async fn await_server(&mut self) -> Result<RunOutcome> {
        let limit = self.config.discovery.server_wait_attempts;
        let mut last_election = self.c.clock.now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let records = self.engine.discover(QueryMode::ServerFirst).await;
            if let Some(server) = self.pick_server(&records) {
                self.select(&server);
                return self.join(server).await;
            }
            self.emit(
                Event::debug("discovery_poll")
                    .field("state", "await_server")
                    .field("attempt", attempt)
                    .field("records", records.len()),
            );

            let seen = self.canonical_visible(&records);
            if let Some(outcome) = self.try_failopen(seen).await? {
                return Ok(outcome);
            }

            if limit > 0 && attempt >= limit {
                let reason = "server_wait_exhausted".to_string();
                self.emit(Event::warn("discovery_deferred").field("reason", &reason).field("attempts", attempt));
                return Ok(RunOutcome::Deferred { reason });
            }

            self.c.clock.sleep(self.config.poll_interval()).await;
            if self.c.clock.elapsed_since(last_election) >= self.config.reelect_interval() {
                last_election = self.c.clock.now();
                if self.elect().await.winner {
                    return self.become_leader().await;
                }
            }
        }
    }

    /// Join the fallback host when fail-open is due and every gate passes
    async fn try_failopen(&mut self, canonical_seen: bool) -> Result<Option<RunOutcome>> {
        let Some(tracker) = &self.tracker else { return Ok(None) };
        if canonical_seen || self.c.clock.elapsed_since(tracker.started) < tracker.timeout {
            return Ok(None);
        }

        let target = fallback_host(self.config.failopen.server_index);
        if same_host(&target, &self.host) {
            self.emit(Event::info("discovery_failopen_deferred").field("reason", "self_target").quoted("host", &target));
            return Ok(None);
        }

        if let Err(e) = self.absence_gate().await {
            self.emit(Event::warn("discovery_failopen_deferred").field("reason", e.reason()));
            return Ok(None);
        }

        let probe = ProbeTarget { host: target.clone(), ip: None, port: self.config.cluster.api_port };
        if let Err(e) = self.c.probe.check(&probe).await {
            tracing::info!("{}", e);
            self.emit(Event::warn("discovery_failopen_deferred").field("reason", e.reason()).quoted("host", &target));
            return Ok(None);
        }

        let url = format!("https://{}:{}", target, self.config.cluster.api_port);
        let mode = JoinMode::for_join(self.config.cluster.servers);
        self.emit(Event::warn("failopen_join").quoted("host", &target).field("url", &url).field("mode", mode));
        let request = InstallRequest { mode, url: Some(url.clone()), token: Some(self.join_token()?), server_ip: None };
        self.c.installer.install(&request).await?;
        self.emit(Event::info("discovery_failopen_success").field("url", &url));

        self.ready(mode, &url).await;
        Ok(Some(RunOutcome::FailOpenJoined { url }))
    }

    /// Re-browse to make sure no canonical record is hiding behind a transient miss
    async fn absence_gate(&self) -> Result<()> {
        if !self.config.failopen.absence_gate {
            self.emit(Event::info("mdns_absence_gate").field("outcome", "skipped"));
            return Ok(());
        }

        let attempts = self.config.failopen.absence_attempts;
        let retry = self.config.query_retry();
        for attempt in 1..=attempts {
            let records = self.engine.discover(QueryMode::ServerFirst).await;
            if let Some(record) = self.others(&records).into_iter().find(|r| r.role().is_some()) {
                self.emit(
                    Event::warn("mdns_absence_gate")
                        .field("outcome", "unconfirmed")
                        .field("attempt", attempt)
                        .quoted("host", &record.host),
                );
                return Err(Error::AbsenceGateUnconfirmed { host: record.host.clone() });
            }
            if attempt < attempts {
                self.c.clock.sleep(retry.delay_for(attempt)).await;
            }
        }
        self.emit(Event::info("mdns_absence_gate").field("outcome", "confirmed").field("attempts", attempts));
        Ok(())
    }

    fn join_token(&self) -> Result<String> {
        self.config.token.clone().ok_or_else(|| {
            Error::Config(format!(
                "no join token: set SUGARKUBE_TOKEN_{} or SUGARKUBE_TOKEN",
                self.config.cluster.env.to_ascii_uppercase()
            ))
        })
    }

    async fn join(&mut self, record: ServiceRecord) -> Result<RunOutcome> {
        let url = record.api_url();
        let mode = JoinMode::for_join(self.config.cluster.servers);
        let request = InstallRequest {
            mode,
            url: Some(url.clone()),
            token: Some(self.join_token()?),
            server_ip: record.ipv4(),
        };
        self.c.installer.install(&request).await?;
        self.emit(
            Event::info("join_complete")
                .field("mode", mode)
                .field("url", &url)
                .field("server_ip", record.ipv4().map(|ip| ip.to_string()).unwrap_or_default()),
        );

        if mode == JoinMode::Server {
            let mut ad = self.advertisement(Role::Server);
            ad.leader = record.leader_or_host().to_string();
            if self.publish(&ad).await {
                self.self_check(&ad).await;
            }
        }

        self.ready(mode, &url).await;
        Ok(RunOutcome::Joined { url })
    }

    async fn ready(&mut self, mode: JoinMode, url: &str) {
        if self.candidacy {
            match self.c.advertiser.withdraw(Role::Bootstrap).await {
                Ok(()) => self.candidacy = false,
                Err(e) => tracing::warn!("Withdrawing bootstrap candidacy failed: {}", e),
            }
        }
        self.emit(Event::info("discovery_ready").field("mode", mode).field("url", url));
    }
}

/// Self-check request for an already-running node; used by the CLI
pub fn selfcheck_request(config: &Config, role: Role, host: &str) -> SelfCheckRequest {
    let ad = match role {
        Role::Bootstrap => Advertisement::bootstrap(&config.cluster.name, &config.cluster.env, host, config.cluster.api_port),
        Role::Server => Advertisement::server(&config.cluster.name, &config.cluster.env, host, config.cluster.api_port),
    };
    SelfCheckRequest {
        instance: ad.instance(),
        service_type: ad.service_type(),
        domain: DEFAULT_DOMAIN.to_string(),
        expected_host: Some(ad.host.clone()),
        require_phase: Some(match role {
            Role::Bootstrap => Phase::Bootstrap,
            Role::Server => Phase::Server,
        }),
        require_role: Some(role),
        require_ipv4: config.selfcheck.require_ipv4,
    }
}
