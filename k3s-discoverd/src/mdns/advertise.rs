use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use shared::protocol::{
    instance_name, service_type, DEFAULT_DOMAIN, TXT_CLUSTER, TXT_ENV, TXT_HOST, TXT_IP4, TXT_IP6, TXT_K3S,
    TXT_LEADER, TXT_PHASE, TXT_ROLE, TXT_STATE,
};
use shared::types::{display_host, Phase, Role};
use crate::error::{Error, Result};

/// What this node publishes about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub cluster: String,
    pub env: String,
    /// Host name, `.local` form
    pub host: String,
    pub role: Role,
    pub phase: Phase,
    pub leader: String,
    pub port: u16,
    pub ip4: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
    /// Extra `key=value` pairs appended after the baseline
    pub extra: Vec<(String, String)>,
}

impl Advertisement {
    /// Candidacy before election: `role=bootstrap phase=bootstrap state=pending`
    pub fn bootstrap(cluster: &str, env: &str, host: &str, port: u16) -> Self {
        let host = display_host(host);
        Self {
            cluster: cluster.to_ascii_lowercase(),
            env: env.to_ascii_lowercase(),
            leader: host.clone(),
            host,
            role: Role::Bootstrap,
            phase: Phase::Bootstrap,
            port,
            ip4: None,
            ip6: None,
            extra: Vec::new(),
        }
    }

    /// A running control plane: `role=server phase=server leader=<self> state=ready`
    pub fn server(cluster: &str, env: &str, host: &str, port: u16) -> Self {
        Self { role: Role::Server, phase: Phase::Server, ..Self::bootstrap(cluster, env, host, port) }
    }

    pub fn with_addresses(mut self, ip4: Option<Ipv4Addr>, ip6: Option<Ipv6Addr>) -> Self {
        self.ip4 = ip4;
        self.ip6 = ip6;
        self
    }

    pub fn service_type(&self) -> String {
        service_type(&self.cluster, &self.env)
    }

    /// `k3s-<cluster>-<env>@<short host> (<role>)`
    pub fn instance(&self) -> String {
        let short = self.host.split('.').next().unwrap_or(&self.host);
        instance_name(&self.cluster, &self.env, short, self.role.as_str())
    }

    fn state(&self) -> &'static str {
        match self.role {
            Role::Bootstrap => "pending",
            Role::Server => "ready",
        }
    }

    /// TXT pairs in publication order. Extras override baseline keys.
    pub fn txt(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = vec![
            (TXT_K3S.into(), "1".into()),
            (TXT_CLUSTER.into(), self.cluster.clone()),
            (TXT_ENV.into(), self.env.clone()),
            (TXT_ROLE.into(), self.role.to_string()),
            (TXT_PHASE.into(), self.phase.to_string()),
            (TXT_LEADER.into(), self.leader.clone()),
            (TXT_HOST.into(), self.host.clone()),
        ];
        if let Some(ip4) = self.ip4 {
            pairs.push((TXT_IP4.into(), ip4.to_string()));
        }
        if let Some(ip6) = self.ip6 {
            pairs.push((TXT_IP6.into(), ip6.to_string()));
        }
        pairs.push((TXT_STATE.into(), self.state().into()));

        for (key, value) in &self.extra {
            match pairs.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.clone(),
                None => pairs.push((key.clone(), value.clone())),
            }
        }
        pairs
    }
}

#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn advertise(&self, ad: &Advertisement) -> Result<()>;

    /// Stop publishing `role`
    async fn withdraw(&self, role: Role) -> Result<()>;
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Body of an Avahi static service file for `ad`
pub fn render_service_xml(ad: &Advertisement) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" standalone='no'?>\n");
    xml.push_str("<!DOCTYPE service-group SYSTEM \"avahi-service.dtd\">\n");
    xml.push_str("<service-group>\n");
    xml.push_str(&format!("  <name replace-wildcards=\"no\">{}</name>\n", xml_escape(&ad.instance())));
    xml.push_str("  <service>\n");
    xml.push_str(&format!("    <type>{}</type>\n", xml_escape(&ad.service_type())));
    xml.push_str(&format!("    <port>{}</port>\n", ad.port));
    for (key, value) in ad.txt() {
        xml.push_str(&format!("    <txt-record>{}={}</txt-record>\n", xml_escape(&key), xml_escape(&value)));
    }
    xml.push_str("  </service>\n");
    xml.push_str("</service-group>\n");
    xml
}

/// Publishes through Avahi: bootstrap candidacy as a transient
/// `avahi-publish` child, the server role as a static service file.
/// Withdrawal only touches the file for its own cluster and environment.
pub struct AvahiAdvertiser {
    service_dir: PathBuf,
    cluster: String,
    env: String,
    publish_bin: String,
    candidacy: Mutex<Option<tokio::process::Child>>,
}

impl AvahiAdvertiser {
    pub fn new(service_dir: impl Into<PathBuf>, cluster: &str, env: &str) -> Self {
        Self {
            service_dir: service_dir.into(),
            cluster: cluster.to_ascii_lowercase(),
            env: env.to_ascii_lowercase(),
            publish_bin: "avahi-publish".to_string(),
            candidacy: Mutex::new(None),
        }
    }

    pub fn service_file(&self, cluster: &str, env: &str) -> PathBuf {
        self.service_dir.join(format!("k3s-{}-{}.service", cluster, env))
    }

    fn stop_candidacy(&self) {
        let child = match self.candidacy.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::debug!("avahi-publish already gone: {}", e);
            }
        }
    }

    fn publish_candidacy(&self, ad: &Advertisement) -> Result<()> {
        self.stop_candidacy();
        let txt: Vec<String> = ad.txt().into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let child = tokio::process::Command::new(&self.publish_bin)
            .args(["-s", "-H", ad.host.as_str(), ad.instance().as_str(), ad.service_type().as_str()])
            .arg(ad.port.to_string())
            .args(&txt)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!("Publishing {} via {} (pid {:?})", ad.instance(), self.publish_bin, child.id());
        match self.candidacy.lock() {
            Ok(mut slot) => *slot = Some(child),
            Err(poisoned) => *poisoned.into_inner() = Some(child),
        }
        Ok(())
    }

    async fn write_service_file(&self, ad: &Advertisement) -> Result<()> {
        let path = self.service_file(&ad.cluster, &ad.env);
        tokio::fs::create_dir_all(&self.service_dir).await?;
        write_atomic(&path, &render_service_xml(ad)).await?;
        tracing::info!("Wrote Avahi service file {:?}", path);
        Ok(())
    }
}

async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("service.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Advertiser for AvahiAdvertiser {
    async fn advertise(&self, ad: &Advertisement) -> Result<()> {
        match ad.role {
            Role::Bootstrap => self.publish_candidacy(ad),
            Role::Server => {
                self.stop_candidacy();
                self.write_service_file(ad).await
            }
        }
    }

    async fn withdraw(&self, role: Role) -> Result<()> {
        match role {
            Role::Bootstrap => self.stop_candidacy(),
            Role::Server => {
                let path = self.service_file(&self.cluster, &self.env);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => tracing::info!("Removed Avahi service file {:?}", path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

impl Drop for AvahiAdvertiser {
    fn drop(&mut self) {
        self.stop_candidacy();
    }
}

/// Publishes with the in-process `mdns-sd` responder
pub struct NativeAdvertiser {
    daemon: ServiceDaemon,
    registered: Mutex<Vec<(Role, String)>>,
}

impl NativeAdvertiser {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self { daemon, registered: Mutex::new(Vec::new()) }
    }

    fn service_info(ad: &Advertisement) -> Result<ServiceInfo> {
        let ty_domain = format!("{}.{}.", ad.service_type(), DEFAULT_DOMAIN);
        let host_name = format!("{}.", ad.host.trim_end_matches('.'));
        let properties: HashMap<String, String> = ad.txt().into_iter().collect();
        let addresses: Vec<std::net::IpAddr> = ad
            .ip4
            .map(Into::into)
            .into_iter()
            .chain(ad.ip6.map(Into::into))
            .collect();

        let info = ServiceInfo::new(&ty_domain, &ad.instance(), &host_name, &addresses[..], ad.port, properties)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        Ok(if addresses.is_empty() { info.enable_addr_auto() } else { info })
    }
}

#[async_trait]
impl Advertiser for NativeAdvertiser {
    async fn advertise(&self, ad: &Advertisement) -> Result<()> {
        let info = Self::service_info(ad)?;
        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        tracing::info!("Registered {} on port {}", fullname, ad.port);

        {
            let mut registered = self.registered.lock().unwrap_or_else(|p| p.into_inner());
            if !registered.iter().any(|(_, name)| *name == fullname) {
                registered.push((ad.role, fullname));
            }
        }
        // A server advertisement replaces the candidacy
        if ad.role == Role::Server {
            self.withdraw(Role::Bootstrap).await?;
        }
        Ok(())
    }

    async fn withdraw(&self, role: Role) -> Result<()> {
        let names: Vec<String> = {
            let mut registered = self.registered.lock().unwrap_or_else(|p| p.into_inner());
            let names = registered.iter().filter(|(r, _)| *r == role).map(|(_, n)| n.clone()).collect();
            registered.retain(|(r, _)| *r != role);
            names
        };
        for name in names {
            self.daemon
                .unregister(&name)
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
            tracing::info!("Unregistered {}", name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_ad() -> Advertisement {
        Advertisement::server("sugar", "dev", "sugarkube0", 6443)
            .with_addresses(Some(Ipv4Addr::new(192, 0, 2, 10)), None)
    }

    #[test]
    fn test_bootstrap_txt_baseline() {
        let ad = Advertisement::bootstrap("Sugar", "DEV", "host0.local", 6443);
        assert_eq!(ad.instance(), "k3s-sugar-dev@host0 (bootstrap)");
        assert_eq!(ad.service_type(), "_k3s-sugar-dev._tcp");
        let txt: Vec<String> = ad.txt().into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        assert_eq!(
            txt,
            vec![
                "k3s=1",
                "cluster=sugar",
                "env=dev",
                "role=bootstrap",
                "phase=bootstrap",
                "leader=host0.local",
                "host=host0.local",
                "state=pending",
            ]
        );
    }

    #[test]
    fn test_extra_pairs_override_baseline() {
        let mut ad = server_ad();
        ad.extra = vec![("state".into(), "joining".into()), ("token_hint".into(), "x".into())];
        let txt = ad.txt();
        assert!(txt.contains(&("state".to_string(), "joining".to_string())));
        assert_eq!(txt.last(), Some(&("token_hint".to_string(), "x".to_string())));
        assert!(txt.contains(&("ip4".to_string(), "192.0.2.10".to_string())));
    }

    #[test]
    fn test_render_service_xml() {
        let xml = render_service_xml(&server_ad());
        assert!(xml.starts_with("<?xml version=\"1.0\" standalone='no'?>"));
        assert!(xml.contains("<name replace-wildcards=\"no\">k3s-sugar-dev@sugarkube0 (server)</name>"));
        assert!(xml.contains("<type>_k3s-sugar-dev._tcp</type>"));
        assert!(xml.contains("<port>6443</port>"));
        assert!(xml.contains("<txt-record>role=server</txt-record>"));
        assert!(xml.contains("<txt-record>leader=sugarkube0.local</txt-record>"));
        assert!(xml.contains("<txt-record>state=ready</txt-record>"));
        assert!(xml.trim_end().ends_with("</service-group>"));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[tokio::test]
    async fn test_server_role_writes_and_withdraws_service_file() {
        let dir = tempfile::tempdir().unwrap();
        let advertiser = AvahiAdvertiser::new(dir.path().join("services"), "sugar", "dev");
        advertiser.advertise(&server_ad()).await.unwrap();

        let path = advertiser.service_file("sugar", "dev");
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, render_service_xml(&server_ad()));

        advertiser.withdraw(Role::Server).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_withdraw_without_directory_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let advertiser = AvahiAdvertiser::new(dir.path().join("missing"), "sugar", "dev");
        advertiser.withdraw(Role::Server).await.unwrap();
        advertiser.withdraw(Role::Bootstrap).await.unwrap();
    }

    #[tokio::test]
    async fn test_withdraw_keeps_other_clusters_service_files() {
        let dir = tempfile::tempdir().unwrap();
        let services = dir.path().join("services");
        let dev = AvahiAdvertiser::new(services.clone(), "sugar", "dev");
        let prod = AvahiAdvertiser::new(services.clone(), "sugar", "prod");
        let lab = AvahiAdvertiser::new(services.clone(), "lab", "dev");
        dev.advertise(&server_ad()).await.unwrap();
        prod.advertise(&Advertisement::server("sugar", "prod", "sugarkube0", 6443)).await.unwrap();
        lab.advertise(&Advertisement::server("lab", "dev", "sugarkube0", 6443)).await.unwrap();
        std::fs::write(services.join("k3s-notes.service"), "unrelated").unwrap();

        dev.withdraw(Role::Server).await.unwrap();

        assert!(!dev.service_file("sugar", "dev").exists());
        assert!(prod.service_file("sugar", "prod").exists());
        assert!(lab.service_file("lab", "dev").exists());
        assert!(services.join("k3s-notes.service").exists());
    }
}
