use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::protocol::{TXT_IP4, TXT_IP6, TXT_LEADER, TXT_PHASE, TXT_ROLE};

/// Role a node advertises in the `role` TXT key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Bootstrap,
    Server,
}

/// Lifecycle phase advertised in the `phase` TXT key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Bootstrap,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Bootstrap => "bootstrap",
            Role::Server => "server",
        }
    }
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Bootstrap => "bootstrap",
            Phase::Server => "server",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bootstrap" => Ok(Role::Bootstrap),
            "server" => Ok(Role::Server),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bootstrap" => Ok(Phase::Bootstrap),
            "server" => Ok(Phase::Server),
            other => Err(format!("unknown phase: {}", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordSource {
    #[serde(rename = "resolvectl")]
    Resolvectl,
    #[serde(rename = "avahi-browse")]
    AvahiBrowse,
    #[serde(rename = "mdns-sd")]
    Native,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::Resolvectl => "resolvectl",
            RecordSource::AvahiBrowse => "avahi-browse",
            RecordSource::Native => "mdns-sd",
        }
    }
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discovered k3s advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service instance label, e.g. "k3s-sugar-dev@sugarkube0 (server)". Display only.
    pub instance: String,

    /// Service type the record was announced under, e.g. "_k3s-sugar-dev._tcp"
    pub service_type: String,

    /// Host name ending in ".local" with trailing dots stripped; case preserved
    pub host: String,

    /// Preferred address (IPv4 when both families were seen), empty when unresolved
    pub address: String,

    /// API port
    pub port: u16,

    /// TXT metadata with lower-cased keys
    pub txt: BTreeMap<String, String>,

    /// Provenance of the record
    pub source: RecordSource,

    /// Raw line(s) the record was built from
    pub raw: Vec<String>,

    /// False for placeholders synthesized from a bare announcement
    pub resolved: bool,
}

impl ServiceRecord {
    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn role(&self) -> Option<Role> {
        self.txt_value(TXT_ROLE).and_then(|r| r.parse().ok())
    }

    pub fn phase(&self) -> Option<Phase> {
        self.txt_value(TXT_PHASE).and_then(|p| p.parse().ok())
    }

    pub fn leader(&self) -> Option<&str> {
        self.txt_value(TXT_LEADER)
    }

    /// The advertised leader, or the host itself when no leader is named
    pub fn leader_or_host(&self) -> &str {
        self.leader().unwrap_or(&self.host)
    }

    /// Every address the record carries: the resolved one plus `ip4`/`ip6` TXT hints
    pub fn addresses(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let candidates = [
            Some(self.address.as_str()),
            self.txt_value(TXT_IP4),
            self.txt_value(TXT_IP6),
        ];
        for addr in candidates.into_iter().flatten() {
            let addr = addr.trim();
            if !addr.is_empty() && !out.contains(&addr) {
                out.push(addr);
            }
        }
        out
    }

    /// First dotted-quad address among `addresses()`
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addresses().into_iter().find_map(|a| a.parse::<Ipv4Addr>().ok())
    }

    pub fn has_ipv4(&self) -> bool {
        self.ipv4().is_some()
    }

    pub fn is_server(&self) -> bool {
        self.role() == Some(Role::Server)
    }

    pub fn is_bootstrap(&self) -> bool {
        self.role() == Some(Role::Bootstrap)
    }

    /// Merge key: whitespace-collapsed lower-case instance plus the raw `role` value
    pub fn key(&self) -> (String, String) {
        let instance = self.instance.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
        let role = self.txt.get(TXT_ROLE).cloned().unwrap_or_default();
        (instance, role)
    }

    /// `https://<host>:<port>` for joining this record's API
    pub fn api_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

/// One query or self-check cycle. Produced and consumed within a single call.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryAttempt {
    pub attempt: u32,
    pub service_type: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub records: Vec<ServiceRecord>,
    pub failure: Option<String>,
}

/// Lowercase, trimmed, trailing-dot-free form of a host used for comparisons
pub fn norm_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Host for display and storage: trailing dots stripped, ".local" appended when missing
pub fn display_host(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.to_ascii_lowercase().ends_with(".local") {
        trimmed.to_string()
    } else {
        format!("{}.local", trimmed)
    }
}

/// Compare host labels, tolerating case, trailing dots and a ".local" suffix
pub fn same_host(lhs: &str, rhs: &str) -> bool {
    let lhs = norm_host(lhs);
    let rhs = norm_host(rhs);
    if lhs.is_empty() || rhs.is_empty() {
        return false;
    }
    if lhs == rhs {
        return true;
    }
    let strip = |h: &str| h.strip_suffix(".local").map(str::to_string).unwrap_or_else(|| h.to_string());
    strip(&lhs) == strip(&rhs)
}
