use std::collections::BTreeMap;
use std::net::IpAddr;
use shared::protocol::TXT_IP6;
use shared::types::{display_host, RecordSource, ServiceRecord};
use super::parser::{insert_pair, unescape};

/// Parse `resolvectl service <instance> <type> <domain>` output.
///
/// ```text
/// k3s-sugar-dev@host0 (server)._k3s-sugar-dev._tcp.local: host0.local:6443 [priority=0, weight=0]
///         192.168.1.10%eth0
///         fe80::1%eth0
///         "role=server"
///
/// -- Information acquired via protocol mDNS/IPv4 in 2.1ms.
/// ```
pub fn parse_resolvectl<I, S>(lines: I, service_type: &str) -> Vec<ServiceRecord>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut records = Vec::new();
    let mut current: Option<Pending> = None;

    for line in lines {
        let line = line.as_ref().trim_end();
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with("--") {
            records.extend(current.take().map(Pending::finish));
            continue;
        }

        if !line.starts_with(char::is_whitespace) {
            records.extend(current.take().map(Pending::finish));
            current = Pending::start(line, service_type);
            continue;
        }

        if let Some(pending) = current.as_mut() {
            pending.absorb(trimmed);
        }
    }
    records.extend(current.take().map(Pending::finish));
    records
}

struct Pending {
    instance: String,
    service_type: String,
    host: String,
    port: u16,
    addresses: Vec<IpAddr>,
    txt: BTreeMap<String, String>,
    raw: Vec<String>,
}

impl Pending {
    fn start(line: &str, service_type: &str) -> Option<Self> {
        let (name, target) = line.rsplit_once(": ")?;
        let endpoint = target.split_whitespace().next()?;
        let (host, port) = endpoint.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;

        let name = unescape(name.trim());
        let instance = [format!(".{}.local", service_type), format!(".{}", service_type)]
            .iter()
            .find_map(|suffix| name.strip_suffix(suffix.as_str()).map(str::to_string))
            .unwrap_or(name);

        Some(Self {
            instance,
            service_type: service_type.to_string(),
            host: display_host(host),
            port,
            addresses: Vec::new(),
            txt: BTreeMap::new(),
            raw: vec![line.to_string()],
        })
    }

    fn absorb(&mut self, line: &str) {
        self.raw.push(line.to_string());
        let bare = line.split('%').next().unwrap_or(line);
        if let Ok(addr) = bare.parse::<IpAddr>() {
            self.addresses.push(addr);
        } else if line.contains('=') {
            insert_pair(&mut self.txt, line);
        }
    }

    fn finish(mut self) -> ServiceRecord {
        let v4 = self.addresses.iter().find(|a| a.is_ipv4()).copied();
        let v6 = self.addresses.iter().find(|a| a.is_ipv6()).copied();
        let address = v4.or(v6).map(|a| a.to_string()).unwrap_or_default();
        if let (Some(_), Some(v6)) = (v4, v6) {
            self.txt.entry(TXT_IP6.to_string()).or_insert_with(|| v6.to_string());
        }

        ServiceRecord {
            instance: self.instance,
            service_type: self.service_type,
            host: self.host,
            address,
            port: self.port,
            txt: self.txt,
            source: RecordSource::Resolvectl,
            raw: self.raw,
            resolved: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
k3s-sugar-dev@host0 (server)._k3s-sugar-dev._tcp.local: host0.local:6443 [priority=0, weight=0]
                                          fe80::1%eth0
                                          192.168.1.10%eth0
                                          \"role=server\"
                                          \"phase=server\"
                                          \"leader=host0.local\"

-- Information acquired via protocol mDNS/IPv4 in 2.1ms.
-- Data is authenticated: no
";

    #[test]
    fn test_parse_service_block() {
        let records = parse_resolvectl(OUTPUT.lines(), "_k3s-sugar-dev._tcp");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.instance, "k3s-sugar-dev@host0 (server)");
        assert_eq!(record.host, "host0.local");
        assert_eq!(record.port, 6443);
        assert_eq!(record.address, "192.168.1.10");
        assert_eq!(record.txt.get("ip6").map(String::as_str), Some("fe80::1"));
        assert_eq!(record.leader(), Some("host0.local"));
        assert_eq!(record.source, RecordSource::Resolvectl);
    }

    #[test]
    fn test_block_without_txt_has_empty_map() {
        let output = "k3s-sugar-dev@host0 (server)._k3s-sugar-dev._tcp.local: host0:6443\n    192.0.2.10\n";
        let records = parse_resolvectl(output.lines(), "_k3s-sugar-dev._tcp");
        assert_eq!(records.len(), 1);
        assert!(records[0].txt.is_empty());
        assert_eq!(records[0].host, "host0.local");
    }

    #[test]
    fn test_error_output_yields_nothing() {
        let output = "k3s-sugar-dev@host0 (server)._k3s-sugar-dev._tcp.local: resolve call failed: No appropriate name servers\n";
        assert!(parse_resolvectl(output.lines(), "_k3s-sugar-dev._tcp").is_empty());
    }
}
