//! Turns `avahi-browse` output into typed [`ServiceRecord`]s.
//!
//! Three input shapes are accepted:
//!
//! * `--parsable --resolve` lines (`=;eth0;IPv4;instance;type;domain;host;addr;port;txt...`).
//!   TXT data arrives either as legacy `txt=key=value` fields or as bare
//!   `"key=value"` tokens separated by spaces or semicolons. Real hardware
//!   emits the bare form, so both must yield the same map.
//! * `--parsable` announcement lines without resolution (`+;eth0;IPv4;instance;type;domain`),
//!   which become unresolved placeholders.
//! * Free-form `--resolve` blocks: a sigil header followed by indented
//!   `hostname = [..]`, `address = [..]`, `port = [..]`, `txt = [..]` lines.
//!
//! Records are merged per `(instance, role)`: resolved beats unresolved, a
//! richer TXT map beats a poorer one, and IPv4 beats IPv6 for `address`.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use shared::protocol::{
    self, DEFAULT_API_PORT, LEGACY_SERVICE_TYPE, TXT_CLUSTER, TXT_ENV, TXT_HOST, TXT_IP6, TXT_K3S,
    TXT_LEADER, TXT_PHASE, TXT_ROLE,
};
use shared::types::{display_host, RecordSource, ServiceRecord};
use crate::error::Error;

const RESOLVED_FIELDS: usize = 9;
const ANNOUNCE_FIELDS: usize = 6;

/// Parse every record regardless of cluster/environment
pub fn parse_lines<I, S>(lines: I, source: RecordSource) -> Vec<ServiceRecord>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parse_with(lines, source, |_| true)
}

/// Parse records that belong to `cluster`/`env`. The scope is applied before
/// merging, so only this cluster's entries take part in it.
pub fn parse_records<I, S>(lines: I, cluster: &str, env: &str) -> Vec<ServiceRecord>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let primary = protocol::service_type(cluster, env);
    let cluster = cluster.to_ascii_lowercase();
    let env = env.to_ascii_lowercase();
    parse_with(lines, RecordSource::AvahiBrowse, |record| belongs_to(record, &primary, &cluster, &env))
}

/// Filter already-built records (resolvectl, mdns-sd) to `cluster`/`env` and merge duplicates
pub fn merge_records<I>(records: I, cluster: &str, env: &str) -> Vec<ServiceRecord>
where
    I: IntoIterator<Item = ServiceRecord>,
{
    let primary = protocol::service_type(cluster, env);
    let cluster = cluster.to_ascii_lowercase();
    let env = env.to_ascii_lowercase();
    let mut merged = RecordSet::default();
    for record in records {
        if belongs_to(&record, &primary, &cluster, &env) {
            merged.insert(record);
        }
    }
    merged.into_records()
}

fn belongs_to(record: &ServiceRecord, primary: &str, cluster: &str, env: &str) -> bool {
    let service_type = normalize_service_type(&record.service_type);
    let txt_matches = |key: &str, expected: &str| match record.txt.get(key) {
        Some(value) => value == expected,
        None => true,
    };

    if service_type == primary {
        return txt_matches(TXT_CLUSTER, cluster) && txt_matches(TXT_ENV, env);
    }
    if service_type == LEGACY_SERVICE_TYPE {
        return record.txt.get(TXT_K3S).map(String::as_str) == Some("1")
            && record.txt.get(TXT_CLUSTER).map(String::as_str) == Some(cluster)
            && record.txt.get(TXT_ENV).map(String::as_str) == Some(env);
    }
    false
}

fn normalize_service_type(service_type: &str) -> String {
    let lowered = service_type.trim().trim_end_matches('.').to_ascii_lowercase();
    lowered.strip_suffix(".local").map(str::to_string).unwrap_or(lowered)
}

fn parse_with<I, S, F>(lines: I, source: RecordSource, accept: F) -> Vec<ServiceRecord>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: Fn(&ServiceRecord) -> bool,
{
    let mut merged = RecordSet::default();
    let mut block: Option<FreeFormBlock> = None;

    let push = |merged: &mut RecordSet, result: Result<Option<ServiceRecord>, Error>| match result {
        Ok(Some(record)) if accept(&record) => merged.insert(record),
        Ok(_) => {}
        Err(e) => tracing::debug!("Dropping discovery entry: {}", e),
    };

    for line in lines {
        let line = line.as_ref().trim_end_matches(['\r', '\n']);

        if line.trim().is_empty() {
            if let Some(pending) = block.take() {
                push(&mut merged, pending.finish(source));
            }
            continue;
        }

        if let Some(pending) = block.as_mut() {
            if line.starts_with(char::is_whitespace) && pending.absorb(line) {
                continue;
            }
            if let Some(pending) = block.take() {
                push(&mut merged, pending.finish(source));
            }
        }

        let Some(sigil) = line.chars().next() else { continue };
        if !matches!(sigil, '=' | '+' | '@') {
            continue;
        }

        if line.contains(';') {
            push(&mut merged, parse_parsable_line(line, source));
        } else if let Some(header) = FreeFormBlock::start(line) {
            if sigil == '=' {
                block = Some(header);
            } else {
                push(&mut merged, Ok(Some(header.placeholder(source))));
            }
        }
    }

    if let Some(pending) = block.take() {
        push(&mut merged, pending.finish(source));
    }

    merged.into_records()
}

fn parse_parsable_line(line: &str, source: RecordSource) -> Result<Option<ServiceRecord>, Error> {
    let fields: Vec<&str> = line.split(';').collect();
    let sigil = fields[0];

    if fields.len() >= RESOLVED_FIELDS {
        let port = fields[8].trim().parse::<u16>().map_err(|_| Error::RecordParse {
            reason: format!("invalid port {:?}", fields[8]),
            line: line.to_string(),
        })?;
        let instance = unescape(fields[3]);
        let host = display_host(&unescape(fields[6]));
        if host.is_empty() {
            return Err(Error::RecordParse { reason: "empty host".into(), line: line.to_string() });
        }
        return Ok(Some(ServiceRecord {
            instance,
            service_type: fields[4].trim().to_string(),
            host,
            address: fields[7].trim().to_string(),
            port,
            txt: parse_txt_fields(&fields[RESOLVED_FIELDS..]),
            source,
            raw: vec![line.to_string()],
            resolved: true,
        }));
    }

    if sigil == "=" {
        return Err(Error::RecordParse {
            reason: format!("resolved entry with {} fields", fields.len()),
            line: line.to_string(),
        });
    }

    if fields.len() >= ANNOUNCE_FIELDS {
        return Ok(Some(placeholder(&unescape(fields[3]), fields[4].trim(), line, source)));
    }

    Err(Error::RecordParse {
        reason: format!("announcement with {} fields", fields.len()),
        line: line.to_string(),
    })
}

/// Record for an announced-but-unresolved instance. The instance name stands
/// in for the host and the leader; the port defaults to the API port.
fn placeholder(instance: &str, service_type: &str, raw: &str, source: RecordSource) -> ServiceRecord {
    let (label, role) = split_role_suffix(instance);
    let host_label = label.rsplit_once('@').map(|(_, host)| host).unwrap_or(label);
    let host = display_host(host_label);

    let mut txt = BTreeMap::new();
    if let Some(role) = role {
        txt.insert(TXT_ROLE.to_string(), role.clone());
        txt.insert(TXT_PHASE.to_string(), role);
    }
    txt.insert(TXT_LEADER.to_string(), host.clone());

    ServiceRecord {
        instance: instance.to_string(),
        service_type: service_type.to_string(),
        host,
        address: String::new(),
        port: DEFAULT_API_PORT,
        txt,
        source,
        raw: vec![raw.to_string()],
        resolved: false,
    }
}

/// Split `k3s-sugar-dev@host0 (bootstrap)` into the label and its role suffix
fn split_role_suffix(instance: &str) -> (&str, Option<String>) {
    let trimmed = instance.trim();
    if let Some(stripped) = trimmed.strip_suffix(')') {
        if let Some((label, role)) = stripped.rsplit_once('(') {
            let role = role.trim().to_ascii_lowercase();
            if !role.is_empty() {
                return (label.trim(), Some(role));
            }
        }
    }
    (trimmed, None)
}

/// Extract TXT pairs from the trailing fields of a parsable line
pub fn parse_txt_fields(fields: &[&str]) -> BTreeMap<String, String> {
    let mut txt = BTreeMap::new();
    for field in fields {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        match field.strip_prefix("txt=") {
            // Legacy form carries exactly one pair per field unless it is quoted
            Some(payload) if !payload.trim_start().starts_with('"') => insert_pair(&mut txt, payload),
            Some(payload) => tokenize(payload).iter().for_each(|t| insert_pair(&mut txt, t)),
            None => tokenize(field).iter().for_each(|t| insert_pair(&mut txt, t)),
        }
    }
    txt
}

pub(crate) fn insert_pair(txt: &mut BTreeMap<String, String>, token: &str) {
    let token = strip_quotes(token.trim());
    let Some((key, value)) = token.split_once('=') else { return };
    let key = key.trim().to_ascii_lowercase();
    if key.is_empty() {
        return;
    }
    let value = strip_quotes(value.trim());
    let value = match key.as_str() {
        TXT_CLUSTER | TXT_ENV | TXT_ROLE | TXT_PHASE => value.to_ascii_lowercase(),
        TXT_HOST | TXT_LEADER => value.trim_end_matches('.').to_string(),
        _ => value.to_string(),
    };
    txt.insert(key, value);
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Split on whitespace, keeping double-quoted tokens intact
fn tokenize(payload: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = payload.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => token.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    tokens
}

/// Decode avahi's `\DDD` decimal and `\.` escapes
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = std::iter::from_fn(|| chars.next_if(|d| d.is_ascii_digit()))
            .take(3)
            .collect();
        if digits.len() == 3 {
            if let Some(decoded) = digits.parse::<u32>().ok().and_then(char::from_u32) {
                out.push(decoded);
                continue;
            }
        }
        if !digits.is_empty() {
            out.push('\\');
            out.push_str(&digits);
            continue;
        }
        match chars.next() {
            Some(next) => out.push(next),
            None => out.push('\\'),
        }
    }
    out
}

/// A free-form `avahi-browse --resolve` block in progress
#[derive(Debug)]
struct FreeFormBlock {
    instance: String,
    service_type: String,
    host: Option<String>,
    address: Option<String>,
    port: Option<String>,
    txt: BTreeMap<String, String>,
    raw: Vec<String>,
}

impl FreeFormBlock {
    /// `=  eth0 IPv4 k3s-sugar-dev@host0 (server)   _k3s-sugar-dev._tcp   local`
    fn start(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < ANNOUNCE_FIELDS {
            return None;
        }
        let service_type = tokens[tokens.len() - 2];
        if !service_type.starts_with('_') {
            return None;
        }
        Some(Self {
            instance: tokens[3..tokens.len() - 2].join(" "),
            service_type: service_type.to_string(),
            host: None,
            address: None,
            port: None,
            txt: BTreeMap::new(),
            raw: vec![line.to_string()],
        })
    }

    fn absorb(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.trim().split_once('=') else { return false };
        let value = value.trim();
        let Some(value) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) else {
            return false;
        };
        match key.trim() {
            "hostname" => self.host = Some(value.to_string()),
            "address" => self.address = Some(value.to_string()),
            "port" => self.port = Some(value.to_string()),
            "txt" => {
                for token in tokenize(value) {
                    insert_pair(&mut self.txt, &token);
                }
            }
            _ => return false,
        }
        self.raw.push(line.to_string());
        true
    }

    fn placeholder(self, source: RecordSource) -> ServiceRecord {
        let raw = self.raw.join("\n");
        placeholder(&self.instance, &self.service_type, &raw, source)
    }

    fn finish(self, source: RecordSource) -> Result<Option<ServiceRecord>, Error> {
        let raw = self.raw.join("\n");
        let (Some(host), Some(port)) = (self.host, self.port) else {
            return Err(Error::RecordParse { reason: "unresolved block".into(), line: raw });
        };
        let port = port.trim().parse::<u16>().map_err(|_| Error::RecordParse {
            reason: format!("invalid port {:?}", port),
            line: raw.clone(),
        })?;
        Ok(Some(ServiceRecord {
            instance: self.instance,
            service_type: self.service_type,
            host: display_host(&host),
            address: self.address.unwrap_or_default(),
            port,
            txt: self.txt,
            source,
            raw: self.raw,
            resolved: true,
        }))
    }
}

/// Discovery-ordered records keyed by `(instance, role)`
#[derive(Default)]
struct RecordSet {
    records: Vec<ServiceRecord>,
    index: HashMap<(String, String), usize>,
}

impl RecordSet {
    fn insert(&mut self, record: ServiceRecord) {
        let key = record.key();
        if let Some(&slot) = self.index.get(&key) {
            self.merge_into(slot, record);
            return;
        }

        // An announcement without a role suffix keys on an empty role, so it
        // pairs with the resolved entry for the same instance across roles.
        if let Some((old_key, slot)) = self.counterpart(&key, record.resolved) {
            if record.resolved {
                self.index.remove(&old_key);
                self.index.insert(key, slot);
            }
            self.merge_into(slot, record);
            return;
        }

        self.index.insert(key, self.records.len());
        self.records.push(record);
    }

    fn merge_into(&mut self, slot: usize, record: ServiceRecord) {
        let existing = std::mem::replace(&mut self.records[slot], record.clone());
        self.records[slot] = merge(existing, record);
    }

    /// Entry of the opposite resolution state for the same instance, as long
    /// as the unresolved side carries no role
    fn counterpart(&self, key: &(String, String), resolved: bool) -> Option<((String, String), usize)> {
        let (instance, role) = key;
        self.index
            .iter()
            .filter(|((other_instance, _), _)| other_instance == instance)
            .filter(|(_, &slot)| self.records[slot].resolved != resolved)
            .filter(|((_, other_role), _)| {
                let placeholder_role = if resolved { other_role } else { role };
                placeholder_role.is_empty()
            })
            .min_by_key(|(_, &slot)| slot)
            .map(|(key, &slot)| (key.clone(), slot))
    }

    fn into_records(self) -> Vec<ServiceRecord> {
        self.records
    }
}

fn is_ipv4(address: &str) -> bool {
    address.parse::<Ipv4Addr>().is_ok()
}

fn is_ipv6(address: &str) -> bool {
    matches!(address.split('%').next().unwrap_or("").parse::<IpAddr>(), Ok(IpAddr::V6(_)))
}

/// True when `candidate` should replace `existing` for the same key
fn is_richer(candidate: &ServiceRecord, existing: &ServiceRecord) -> bool {
    if candidate.resolved != existing.resolved {
        return candidate.resolved;
    }
    let superset = |a: &BTreeMap<String, String>, b: &BTreeMap<String, String>| {
        b.iter().all(|(k, v)| a.get(k) == Some(v))
    };
    if candidate.txt.len() > existing.txt.len() && superset(&candidate.txt, &existing.txt) {
        return true;
    }
    if existing.txt.len() >= candidate.txt.len() && superset(&existing.txt, &candidate.txt) {
        return false;
    }
    candidate.txt.len() > existing.txt.len()
}

fn merge(existing: ServiceRecord, candidate: ServiceRecord) -> ServiceRecord {
    let (mut winner, loser) = if is_richer(&candidate, &existing) {
        (candidate, existing)
    } else {
        (existing, candidate)
    };

    if winner.resolved && loser.resolved {
        if !is_ipv4(&winner.address) && is_ipv4(&loser.address) {
            let displaced = std::mem::replace(&mut winner.address, loser.address.clone());
            if is_ipv6(&displaced) {
                winner.txt.entry(TXT_IP6.to_string()).or_insert(displaced);
            }
        } else if is_ipv4(&winner.address) && is_ipv6(&loser.address) {
            winner.txt.entry(TXT_IP6.to_string()).or_insert_with(|| loser.address.clone());
        } else if winner.address.is_empty() {
            winner.address = loser.address.clone();
        }
    }

    for line in loser.raw {
        if !winner.raw.contains(&line) {
            winner.raw.push(line);
        }
    }
    winner
}
