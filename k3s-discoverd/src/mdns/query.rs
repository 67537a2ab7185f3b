use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use shared::protocol::service_types;
use shared::types::{norm_host, DiscoveryAttempt, Phase, ServiceRecord};
use crate::clock::{Clock, RetryPolicy};
use crate::error::Error;
use crate::events::{Event, EventSink};
use super::source::{BrowseOutput, BrowseRequest, DiscoverySource};

/// What a query reports about the discovered records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    ServerFirst,
    BootstrapLeaders,
    ServerHosts,
    ServerCount,
    BootstrapHosts,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::ServerFirst => "server-first",
            QueryMode::BootstrapLeaders => "bootstrap-leaders",
            QueryMode::ServerHosts => "server-hosts",
            QueryMode::ServerCount => "server-count",
            QueryMode::BootstrapHosts => "bootstrap-hosts",
        }
    }

    /// Server lookups never want this node's own advertisement
    fn ignores_local(&self) -> bool {
        matches!(self, QueryMode::ServerFirst | QueryMode::ServerCount)
    }
}

impl FromStr for QueryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server-first" => Ok(QueryMode::ServerFirst),
            "bootstrap-leaders" => Ok(QueryMode::BootstrapLeaders),
            "server-hosts" => Ok(QueryMode::ServerHosts),
            "server-count" => Ok(QueryMode::ServerCount),
            "bootstrap-hosts" => Ok(QueryMode::BootstrapHosts),
            other => Err(format!("unsupported mode: {}", other)),
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster scope and retry budget for a query
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub cluster: String,
    pub env: String,
    pub retry: RetryPolicy,
}

/// Browses the cluster's service types and renders the result per [`QueryMode`].
///
/// The primary type is browsed first and the legacy type only when it yields
/// nothing. If both resolving browses come back empty a non-resolving browse
/// runs so bare announcements still show up as placeholders.
pub struct QueryEngine {
    source: Arc<dyn DiscoverySource>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    options: QueryOptions,
}

impl QueryEngine {
    pub fn new(
        source: Arc<dyn DiscoverySource>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        options: QueryOptions,
    ) -> Self {
        Self { source, clock, events, options }
    }

    pub async fn query(&self, mode: QueryMode) -> Vec<String> {
        render(mode, &self.discover(mode).await)
    }

    /// Records for this cluster, in discovery order
    pub async fn discover(&self, mode: QueryMode) -> Vec<ServiceRecord> {
        let types = service_types(&self.options.cluster, &self.options.env);
        for resolve in [true, false] {
            for service_type in &types {
                let request = BrowseRequest {
                    service_type: service_type.clone(),
                    resolve,
                    ignore_local: mode.ignores_local(),
                };
                let records = self.browse_with_retry(&request).await;
                if !records.is_empty() {
                    return records;
                }
            }
        }
        Vec::new()
    }

    async fn browse_with_retry(&self, request: &BrowseRequest) -> Vec<ServiceRecord> {
        let attempts = self.options.retry.attempts();
        for attempt in 1..=attempts {
            let started_at = self.clock.now();
            let output = self.source.browse(request).await;
            let elapsed = self.clock.elapsed_since(started_at);
            let (records, failure) = match output {
                Ok(output) => self.classify(output, elapsed),
                Err(e) => (Vec::new(), Some(e)),
            };

            let result = DiscoveryAttempt {
                attempt,
                service_type: request.service_type.clone(),
                started_at,
                elapsed_ms: elapsed.as_millis() as u64,
                records,
                failure: failure.as_ref().map(|e| e.to_string()),
            };
            tracing::debug!(
                "browse {} attempt {} took {}ms: {} record(s), failure={:?}",
                result.service_type,
                attempt,
                result.elapsed_ms,
                result.records.len(),
                result.failure
            );

            match failure {
                None => return result.records,
                Some(Error::Timeout { .. }) if !result.records.is_empty() => return result.records,
                Some(e) => {
                    self.events.emit(
                        Event::warn("mdns_query_failure")
                            .field("type", &request.service_type)
                            .field("attempt", attempt)
                            .field("reason", e.reason()),
                    );
                }
            }

            if attempt < attempts {
                self.clock.sleep(self.options.retry.delay_for(attempt)).await;
            }
        }
        Vec::new()
    }

    /// Narrow the output to this cluster and decide whether the call failed
    fn classify(&self, output: BrowseOutput, elapsed: Duration) -> (Vec<ServiceRecord>, Option<Error>) {
        let records = output.scoped(&self.options.cluster, &self.options.env);
        let transient = output.is_transient();
        let BrowseOutput { lines, code, timed_out, stderr, .. } = output;

        self.events.emit(
            Event::debug("mdns_query_attempt")
                .field("source", self.source.name())
                .field("code", code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))
                .field("timed_out", timed_out)
                .field("lines", lines.len())
                .field("records", records.len())
                .field("stderr", &stderr),
        );

        let failure = if timed_out {
            Some(Error::Timeout { after: elapsed, partial: lines })
        } else if transient {
            Some(Error::Transient { code, stderr })
        } else {
            None
        };
        (records, failure)
    }
}

/// First `role=server` record, else the first resolved record that is not a
/// bootstrap candidate
pub fn select_server(records: &[ServiceRecord]) -> Option<&ServiceRecord> {
    records
        .iter()
        .find(|r| r.is_server())
        .or_else(|| records.iter().find(|r| r.resolved && r.role().is_none() && !r.host.is_empty()))
}

fn dedup_hosts<'a>(hosts: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    hosts
        .filter(|h| !h.is_empty() && seen.insert(norm_host(h)))
        .map(str::to_string)
        .collect()
}

fn server_hosts(records: &[ServiceRecord]) -> Vec<String> {
    dedup_hosts(
        records
            .iter()
            .filter(|r| r.is_server() && r.phase() != Some(Phase::Bootstrap))
            .map(|r| r.host.as_str()),
    )
}

pub fn render(mode: QueryMode, records: &[ServiceRecord]) -> Vec<String> {
    match mode {
        QueryMode::ServerFirst => select_server(records).map(|r| r.host.clone()).into_iter().collect(),
        QueryMode::BootstrapLeaders => dedup_hosts(
            records.iter().filter(|r| r.is_bootstrap()).map(|r| r.leader_or_host()),
        ),
        QueryMode::ServerHosts => server_hosts(records),
        QueryMode::ServerCount => vec![server_hosts(records).len().to_string()],
        QueryMode::BootstrapHosts => dedup_hosts(
            records.iter().filter(|r| r.is_bootstrap()).map(|r| r.host.as_str()),
        ),
    }
}
