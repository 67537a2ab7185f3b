use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use shared::protocol::DEFAULT_DOMAIN;
use shared::types::{RecordSource, ServiceRecord};
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use super::parser::{merge_records, parse_lines, parse_records};
use super::resolvectl::parse_resolvectl;

const NATIVE_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseRequest {
    pub service_type: String,
    /// Resolve host, address and TXT; false lists bare announcements
    pub resolve: bool,
    /// Hide services published by this host
    pub ignore_local: bool,
}

impl BrowseRequest {
    pub fn resolving(service_type: impl Into<String>) -> Self {
        Self { service_type: service_type.into(), resolve: true, ignore_local: false }
    }
}

/// One discovery call: the unfiltered records plus what the call reported.
#[derive(Debug, Clone, Default)]
pub struct BrowseOutput {
    pub records: Vec<ServiceRecord>,
    pub lines: Vec<String>,
    /// Set when `lines` is `avahi-browse` text; records parsed from it carry this tag
    pub parsed_from: Option<RecordSource>,
    pub code: Option<i32>,
    pub timed_out: bool,
    pub stderr: String,
}

impl BrowseOutput {
    pub(crate) fn from_lines(lines: Vec<String>, source: RecordSource) -> Self {
        Self {
            records: parse_lines(&lines, source),
            lines,
            parsed_from: Some(source),
            code: Some(0),
            ..Default::default()
        }
    }

    fn from_command(output: CommandOutput, records: Vec<ServiceRecord>, parsed_from: Option<RecordSource>) -> Self {
        Self {
            records,
            lines: output.lines(),
            parsed_from,
            code: output.code,
            timed_out: output.timed_out,
            stderr: output.stderr.trim().to_string(),
        }
    }

    /// Records that belong to `cluster`/`env`. Text is re-parsed with the
    /// scope applied before merging, so a foreign record never absorbs one of ours.
    pub fn scoped(&self, cluster: &str, env: &str) -> Vec<ServiceRecord> {
        match self.parsed_from {
            Some(source) => {
                let mut records = parse_records(&self.lines, cluster, env);
                records.iter_mut().for_each(|r| r.source = source);
                records
            }
            None => merge_records(self.records.iter().cloned(), cluster, env),
        }
    }

    /// Non-zero exit with nothing on stdout; worth retrying
    pub fn is_transient(&self) -> bool {
        !self.timed_out && self.code != Some(0) && self.lines.is_empty()
    }
}

/// Where discovery text comes from. Records are returned unfiltered; the
/// caller narrows them to its cluster and environment.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn browse(&self, request: &BrowseRequest) -> Result<BrowseOutput>;

    /// Targeted resolution of one instance. Sources without one return nothing
    /// so callers fall back to `browse`.
    async fn resolve(&self, _instance: &str, _service_type: &str, _domain: &str) -> Result<BrowseOutput> {
        Ok(BrowseOutput::default())
    }
}

/// Live discovery through `avahi-browse` and `resolvectl`.
///
/// `avahi-browse` listens on every interface avahi-daemon manages and has no
/// option to narrow that, so an interface restriction only reaches the
/// targeted `resolvectl` lookups. The native backend honors it for browsing.
pub struct AvahiSource {
    runner: Arc<dyn CommandRunner>,
    interface: Option<String>,
    timeout: Option<Duration>,
    browse_bin: String,
    resolvectl_bin: String,
}

impl AvahiSource {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        interface: Option<String>,
        timeout: Option<Duration>,
        events: &dyn EventSink,
    ) -> Self {
        if let Some(iface) = &interface {
            events.emit(
                Event::warn("mdns_interface_unscoped")
                    .field("backend", "avahi-browse")
                    .field("interface", iface)
                    .field("hint", "SUGARKUBE_MDNS_BACKEND=native"),
            );
        }
        Self {
            runner,
            interface,
            timeout,
            browse_bin: "avahi-browse".to_string(),
            resolvectl_bin: "resolvectl".to_string(),
        }
    }

    fn browse_spec(&self, request: &BrowseRequest) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.browse_bin)
            .arg(if request.resolve { "-rptk" } else { "-ptk" })
            .timeout(self.timeout);
        if request.ignore_local {
            spec = spec.arg("--ignore-local");
        }
        spec.arg(&request.service_type)
    }

    fn resolve_spec(&self, instance: &str, service_type: &str, domain: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.resolvectl_bin).timeout(self.timeout);
        if let Some(iface) = &self.interface {
            spec = spec.args(["--interface", iface.as_str()]);
        }
        spec.args(["service", instance, service_type, domain])
    }

    /// Missing executables degrade to an empty result with exit code 127
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!("exec argv={:?}", spec.argv());
        match self.runner.run(spec).await {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} not found; continuing without results", spec.program);
                Ok(CommandOutput { code: Some(127), ..Default::default() })
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl DiscoverySource for AvahiSource {
    fn name(&self) -> &'static str {
        "avahi-browse"
    }

    async fn browse(&self, request: &BrowseRequest) -> Result<BrowseOutput> {
        let output = self.run(&self.browse_spec(request)).await?;
        let records = parse_lines(output.lines(), RecordSource::AvahiBrowse);
        Ok(BrowseOutput::from_command(output, records, Some(RecordSource::AvahiBrowse)))
    }

    async fn resolve(&self, instance: &str, service_type: &str, domain: &str) -> Result<BrowseOutput> {
        let output = self.run(&self.resolve_spec(instance, service_type, domain)).await?;
        let records = parse_resolvectl(output.lines(), service_type);
        Ok(BrowseOutput::from_command(output, records, None))
    }
}

/// Static `avahi-browse` text for offline runs. The file is re-read on every
/// browse; a missing file reads as empty.
pub struct StaticSource {
    text: Option<String>,
    path: Option<PathBuf>,
}

impl StaticSource {
    #[cfg(test)]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), path: None }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { text: None, path: Some(path.into()) }
    }

    async fn load(&self) -> Result<String> {
        if let Some(text) = &self.text {
            return Ok(text.clone());
        }
        let Some(path) = &self.path else { return Ok(String::new()) };
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Fixture {:?} missing; treating as empty", path);
                Ok(String::new())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn browse(&self, _request: &BrowseRequest) -> Result<BrowseOutput> {
        let text = self.load().await?;
        let lines = text.lines().filter(|l| !l.trim().is_empty()).map(str::to_string).collect();
        Ok(BrowseOutput::from_lines(lines, RecordSource::AvahiBrowse))
    }
}

/// In-process discovery with `mdns-sd`. Each browse listens for a bounded
/// window and renders what it saw as parsable lines.
pub struct NativeSource {
    daemon: ServiceDaemon,
    window: Duration,
}

impl NativeSource {
    pub fn new(interface: Option<&str>, timeout: Option<Duration>) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(native_error)?;
        if let Some(iface) = interface {
            daemon.disable_interface(IfKind::All).map_err(native_error)?;
            daemon.enable_interface(iface).map_err(native_error)?;
        }
        Ok(Self { daemon, window: timeout.unwrap_or(NATIVE_WINDOW) })
    }

    pub fn daemon(&self) -> &ServiceDaemon {
        &self.daemon
    }
}

fn native_error(e: mdns_sd::Error) -> Error {
    Error::Io(std::io::Error::other(e.to_string()))
}

fn fq_type(service_type: &str) -> String {
    format!("{}.{}.", service_type.trim_end_matches('.'), DEFAULT_DOMAIN)
}

fn instance_label(fullname: &str, fq_type: &str) -> String {
    fullname
        .strip_suffix(fq_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// Render one resolved `ServiceInfo` as `avahi-browse -rpt` lines, one per address
pub fn render_parsable(info: &ServiceInfo, service_type: &str) -> Vec<String> {
    let instance = instance_label(info.get_fullname(), &fq_type(service_type));
    let txt = info
        .get_properties()
        .iter()
        .map(|p| format!("\"{}={}\"", p.key(), p.val_str().replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(" ");
    let host = info.get_hostname().trim_end_matches('.');

    let mut addresses: Vec<_> = info.get_addresses().iter().copied().collect();
    addresses.sort();
    if addresses.is_empty() {
        return vec![format!("+;*;IPv4;{};{};{}", instance, service_type, DEFAULT_DOMAIN)];
    }
    addresses
        .into_iter()
        .map(|addr| {
            let family = if addr.is_ipv4() { "IPv4" } else { "IPv6" };
            format!(
                "=;*;{};{};{};{};{};{};{};{}",
                family, instance, service_type, DEFAULT_DOMAIN, host, addr, info.get_port(), txt
            )
        })
        .collect()
}

/// Drain daemon events until `deadline` or until the daemon drops the channel,
/// rendering the ones `request` asks for as parsable lines
async fn collect_events(
    receiver: flume::Receiver<ServiceEvent>,
    request: &BrowseRequest,
    deadline: tokio::time::Instant,
) -> Vec<String> {
    let full_type = fq_type(&request.service_type);
    let mut lines = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) if request.resolve => {
                lines.extend(render_parsable(&info, &request.service_type));
            }
            Ok(Ok(ServiceEvent::ServiceFound(_, fullname))) if !request.resolve => {
                let instance = instance_label(&fullname, &full_type);
                lines.push(format!("+;*;IPv4;{};{};{}", instance, request.service_type, DEFAULT_DOMAIN));
            }
            Ok(Ok(_)) => {}
            Ok(Err(flume::RecvError::Disconnected)) => {
                tracing::debug!("mdns-sd browse channel for {} closed", full_type);
                break;
            }
            Err(_) => break,
        }
    }
    lines
}

/// Resolved line whose host field is `local`
fn is_local_line(line: &str, local: &str) -> bool {
    line.split(';').nth(6).is_some_and(|host| shared::types::same_host(host, local))
}

#[async_trait]
impl DiscoverySource for NativeSource {
    fn name(&self) -> &'static str {
        "mdns-sd"
    }

    async fn browse(&self, request: &BrowseRequest) -> Result<BrowseOutput> {
        let full_type = fq_type(&request.service_type);
        let receiver = self.daemon.browse(&full_type).map_err(native_error)?;
        let deadline = tokio::time::Instant::now() + self.window;
        let mut lines = collect_events(receiver, request, deadline).await;

        if let Err(e) = self.daemon.stop_browse(&full_type) {
            tracing::debug!("Failed to stop browse for {}: {}", full_type, e);
        }

        if request.ignore_local {
            let local = crate::config::system_hostname().unwrap_or_default();
            lines.retain(|line| !is_local_line(line, &local));
        }
        Ok(BrowseOutput::from_lines(lines, RecordSource::Native))
    }
}
