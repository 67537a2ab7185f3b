//! In-memory stand-ins for the clock, event sink, subprocesses and network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::protocol::DEFAULT_DOMAIN;
use shared::types::{same_host, RecordSource, Role, ServiceRecord};
use crate::clock::Clock;
use crate::cluster::elector::{Election, Elector};
use crate::cluster::installer::{InstallRequest, Installer};
use crate::cluster::probe::{ProbeTarget, ReadinessProbe};
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::mdns::advertise::{Advertisement, Advertiser};
use crate::mdns::source::{BrowseOutput, BrowseRequest, DiscoverySource};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Virtual time: `sleep` advances instantly
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    slept: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            slept: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *locked(&self.now) += chrono::Duration::from_std(by).unwrap();
    }

    /// Total time spent in `sleep`
    pub fn slept(&self) -> Duration {
        *locked(&self.slept)
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *locked(&self.now)
    }

    async fn sleep(&self, duration: Duration) {
        *locked(&self.slept) += duration;
        self.advance(duration);
    }
}

/// Keeps rendered event lines for assertions
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        locked(&self.lines).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        locked(&self.lines).iter().any(|l| l.contains(needle))
    }

    pub fn count(&self, name: &str) -> usize {
        let prefix = format!("event={} ", name);
        let exact = format!("event={}", name);
        locked(&self.lines).iter().filter(|l| l.starts_with(&prefix) || **l == exact).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        locked(&self.lines).push(event.to_string());
    }
}

/// Replays queued command results; an empty queue answers with success
#[derive(Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<std::io::Result<CommandOutput>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_output(&self, output: CommandOutput) {
        locked(&self.queue).push_back(Ok(output));
    }

    pub fn push_stdout(&self, code: i32, stdout: &str) {
        self.push_output(CommandOutput { code: Some(code), stdout: stdout.to_string(), ..Default::default() });
    }

    pub fn push_error(&self, kind: std::io::ErrorKind) {
        locked(&self.queue).push_back(Err(std::io::Error::from(kind)));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        locked(&self.calls).push(spec.clone());
        locked(&self.queue)
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput { code: Some(0), ..Default::default() }))
    }
}

fn lines_output(lines: &[&str]) -> BrowseOutput {
    BrowseOutput::from_lines(lines.iter().map(|l| l.to_string()).collect(), RecordSource::AvahiBrowse)
}

/// Discovery source replaying queued browse and resolve results
#[derive(Default)]
pub struct ScriptedSource {
    browses: Mutex<VecDeque<Result<BrowseOutput>>>,
    resolves: Mutex<VecDeque<BrowseOutput>>,
    requests: Mutex<Vec<BrowseRequest>>,
    resolve_calls: Mutex<Vec<(String, String, String)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_lines(&self, lines: &[&str]) {
        locked(&self.browses).push_back(Ok(lines_output(lines)));
    }

    pub fn push_records(&self, records: Vec<ServiceRecord>) {
        let output = BrowseOutput { lines: vec![String::new(); records.len()], records, code: Some(0), ..Default::default() };
        locked(&self.browses).push_back(Ok(output));
    }

    pub fn push_failure(&self, code: i32, stderr: &str) {
        let output = BrowseOutput { code: Some(code), stderr: stderr.to_string(), ..Default::default() };
        locked(&self.browses).push_back(Ok(output));
    }

    pub fn push_timeout(&self, lines: &[&str]) {
        let mut output = lines_output(lines);
        output.code = None;
        output.timed_out = true;
        locked(&self.browses).push_back(Ok(output));
    }

    pub fn push_resolved(&self, records: Vec<ServiceRecord>) {
        let output = BrowseOutput { lines: vec![String::new(); records.len()], records, code: Some(0), ..Default::default() };
        locked(&self.resolves).push_back(output);
    }

    pub fn requests(&self) -> Vec<BrowseRequest> {
        locked(&self.requests).clone()
    }

    pub fn resolve_calls(&self) -> Vec<(String, String, String)> {
        locked(&self.resolve_calls).clone()
    }
}

#[async_trait]
impl DiscoverySource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn browse(&self, request: &BrowseRequest) -> Result<BrowseOutput> {
        locked(&self.requests).push(request.clone());
        locked(&self.browses).pop_front().unwrap_or_else(|| Ok(lines_output(&[])))
    }

    async fn resolve(&self, instance: &str, service_type: &str, domain: &str) -> Result<BrowseOutput> {
        locked(&self.resolve_calls).push((instance.to_string(), service_type.to_string(), domain.to_string()));
        Ok(locked(&self.resolves).pop_front().unwrap_or_default())
    }
}

/// A shared segment: remote advertisements given as `avahi-browse` text plus
/// whatever this node advertises through it.
pub struct MemoryNetwork {
    local_host: String,
    local_ip: String,
    remote: Mutex<Vec<String>>,
    published: Mutex<Vec<Advertisement>>,
    withdrawn: Mutex<Vec<Role>>,
}

impl MemoryNetwork {
    pub fn new(local_host: &str, local_ip: &str) -> Self {
        Self {
            local_host: local_host.to_string(),
            local_ip: local_ip.to_string(),
            remote: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            withdrawn: Mutex::new(Vec::new()),
        }
    }

    pub fn set_remote(&self, text: &str) {
        *locked(&self.remote) = text.lines().filter(|l| !l.trim().is_empty()).map(str::to_string).collect();
    }

    pub fn published(&self) -> Vec<Advertisement> {
        locked(&self.published).clone()
    }

    pub fn withdrawn(&self) -> Vec<Role> {
        locked(&self.withdrawn).clone()
    }

    fn render(&self, ad: &Advertisement) -> String {
        let txt: Vec<String> = ad.txt().into_iter().map(|(k, v)| format!("\"{}={}\"", k, v)).collect();
        let address = ad.ip4.map(|ip| ip.to_string()).unwrap_or_else(|| self.local_ip.clone());
        format!(
            "=;lo;IPv4;{};{};{};{};{};{};{}",
            ad.instance(),
            ad.service_type(),
            DEFAULT_DOMAIN,
            ad.host,
            address,
            ad.port,
            txt.join(" ")
        )
    }

    fn snapshot(&self, ignore_local: bool) -> Vec<String> {
        let mut lines = locked(&self.remote).clone();
        if !ignore_local {
            let local: Vec<String> = locked(&self.published).iter().map(|ad| self.render(ad)).collect();
            lines.extend(local);
        }
        lines
    }
}

#[async_trait]
impl DiscoverySource for MemoryNetwork {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn browse(&self, request: &BrowseRequest) -> Result<BrowseOutput> {
        let lines: Vec<String> = self
            .snapshot(request.ignore_local)
            .into_iter()
            .filter(|l| l.split(';').nth(4) == Some(request.service_type.as_str()))
            .collect();
        Ok(BrowseOutput::from_lines(lines, RecordSource::AvahiBrowse))
    }
}

#[async_trait]
impl Advertiser for MemoryNetwork {
    async fn advertise(&self, ad: &Advertisement) -> Result<()> {
        assert!(same_host(&ad.host, &self.local_host), "advertised foreign host {}", ad.host);
        let mut published = locked(&self.published);
        published.retain(|existing| existing.role != ad.role);
        if ad.role == Role::Server {
            published.retain(|existing| existing.role != Role::Bootstrap);
        }
        published.push(ad.clone());
        Ok(())
    }

    async fn withdraw(&self, role: Role) -> Result<()> {
        locked(&self.published).retain(|ad| ad.role != role);
        locked(&self.withdrawn).push(role);
        Ok(())
    }
}

/// Elector replaying queued answers; an empty queue loses
#[derive(Default)]
pub struct FakeElector {
    answers: Mutex<VecDeque<Result<Election>>>,
    calls: Mutex<u32>,
}

impl FakeElector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, winner: bool, key: &str) {
        locked(&self.answers).push_back(Ok(Election { winner, key: key.to_string() }));
    }

    pub fn push_error(&self) {
        locked(&self.answers).push_back(Err(Error::Transient { code: Some(1), stderr: "helper crashed".into() }));
    }

    pub fn calls(&self) -> u32 {
        *locked(&self.calls)
    }
}

#[async_trait]
impl Elector for FakeElector {
    async fn elect(&self) -> Result<Election> {
        *locked(&self.calls) += 1;
        locked(&self.answers)
            .pop_front()
            .unwrap_or_else(|| Ok(Election { winner: false, key: String::new() }))
    }
}

/// Readiness probe with a fixed answer
pub struct FakeProbe {
    ready: bool,
    targets: Mutex<Vec<ProbeTarget>>,
}

impl FakeProbe {
    pub fn new(ready: bool) -> Self {
        Self { ready, targets: Mutex::new(Vec::new()) }
    }

    pub fn targets(&self) -> Vec<ProbeTarget> {
        locked(&self.targets).clone()
    }
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn check(&self, target: &ProbeTarget) -> Result<()> {
        locked(&self.targets).push(target.clone());
        if self.ready {
            Ok(())
        } else {
            Err(Error::ApiNotReady { host: target.host.clone(), port: target.port, detail: "refused".into() })
        }
    }
}

/// Records install requests; optionally fails every call
#[derive(Default)]
pub struct FakeInstaller {
    fail: bool,
    requests: Mutex<Vec<InstallRequest>>,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn requests(&self) -> Vec<InstallRequest> {
        locked(&self.requests).clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().filter_map(|r| r.url).collect()
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(&self, request: &InstallRequest) -> Result<()> {
        locked(&self.requests).push(request.clone());
        if self.fail {
            return Err(Error::InstallFailure { code: Some(1), stderr: "install failed".into() });
        }
        Ok(())
    }
}
