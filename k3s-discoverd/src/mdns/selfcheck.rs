use std::sync::Arc;
use shared::types::{same_host, Phase, Role, ServiceRecord};
use crate::clock::{Clock, RetryPolicy};
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use super::source::{BrowseRequest, DiscoverySource};

/// What a node expects to see when it looks up its own advertisement
#[derive(Debug, Clone)]
pub struct SelfCheckRequest {
    pub instance: String,
    pub service_type: String,
    pub domain: String,
    pub expected_host: Option<String>,
    pub require_phase: Option<Phase>,
    pub require_role: Option<Role>,
    pub require_ipv4: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfCheckOutcome {
    Confirmed(ServiceRecord),
    Skipped,
}

/// Confirms this node can observe its own advertisement
pub struct Verifier {
    source: Arc<dyn DiscoverySource>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    skip: bool,
}

fn norm_instance(instance: &str) -> String {
    instance.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase()
}

/// First reason `record` fails `request`, if any
fn rejection(request: &SelfCheckRequest, record: &ServiceRecord) -> Option<&'static str> {
    if let Some(expected) = &request.expected_host {
        if !same_host(expected, &record.host) {
            return Some("host_mismatch");
        }
    }
    if let Some(phase) = request.require_phase {
        match record.phase() {
            None => return Some("phase_missing"),
            Some(p) if p != phase => return Some("phase_mismatch"),
            _ => {}
        }
    }
    if let Some(role) = request.require_role {
        match record.role() {
            None => return Some("role_missing"),
            Some(r) if r != role => return Some("role_mismatch"),
            _ => {}
        }
    }
    if request.require_ipv4 && !record.has_ipv4() {
        return Some("ipv4_missing");
    }
    None
}

impl Verifier {
    pub fn new(
        source: Arc<dyn DiscoverySource>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        retry: RetryPolicy,
        skip: bool,
    ) -> Self {
        Self { source, clock, events, retry, skip }
    }

    /// Look for the advertisement described by `request`, retrying per the policy.
    ///
    /// Each attempt tries a targeted resolve first and falls back to a full
    /// browse when the resolve carries no TXT data. Every rejected candidate
    /// is reported with its reason.
    pub async fn verify(&self, request: &SelfCheckRequest) -> Result<SelfCheckOutcome> {
        if self.skip {
            self.events.emit(
                Event::info("mdns_selfcheck")
                    .field("outcome", "skip")
                    .quoted("instance", &request.instance),
            );
            return Ok(SelfCheckOutcome::Skipped);
        }

        let attempts = self.retry.attempts();
        let mut last_reason = "not_found";
        for attempt in 1..=attempts {
            for record in self.candidates(request).await {
                match rejection(request, &record) {
                    Some(reason) => {
                        last_reason = reason;
                        self.events.emit(
                            Event::debug("mdns_selfcheck_candidate")
                                .field("outcome", "rejected")
                                .field("reason", reason)
                                .field("attempt", attempt)
                                .quoted("host", &record.host)
                                .field("source", record.source),
                        );
                    }
                    None => {
                        self.events.emit(
                            Event::info("mdns_selfcheck")
                                .field("outcome", "confirmed")
                                .quoted("host", &record.host)
                                .field("attempt", attempt)
                                .field("source", record.source),
                        );
                        return Ok(SelfCheckOutcome::Confirmed(record));
                    }
                }
            }
            if attempt < attempts {
                self.clock.sleep(self.retry.delay_for(attempt)).await;
            }
        }

        self.events.emit(
            Event::warn("mdns_selfcheck")
                .field("outcome", "fail")
                .field("reason", last_reason)
                .field("attempts", attempts)
                .quoted("instance", &request.instance),
        );
        Err(Error::SelfCheckExhausted { instance: request.instance.clone(), attempts })
    }

    async fn candidates(&self, request: &SelfCheckRequest) -> Vec<ServiceRecord> {
        let wanted = norm_instance(&request.instance);

        match self.source.resolve(&request.instance, &request.service_type, &request.domain).await {
            Ok(output) => {
                let resolved: Vec<_> = output
                    .records
                    .into_iter()
                    .filter(|r| !r.txt.is_empty() && norm_instance(&r.instance) == wanted)
                    .collect();
                if !resolved.is_empty() {
                    return resolved;
                }
                tracing::debug!("{} resolve did not yield a matching record; browsing", self.source.name());
            }
            Err(e) => tracing::debug!("Resolve of {} failed: {}", request.instance, e),
        }

        match self.source.browse(&BrowseRequest::resolving(&request.service_type)).await {
            Ok(output) => output
                .records
                .into_iter()
                .filter(|r| norm_instance(&r.instance) == wanted)
                .collect(),
            Err(e) => {
                tracing::debug!("Browse of {} failed: {}", request.service_type, e);
                Vec::new()
            }
        }
    }
}
