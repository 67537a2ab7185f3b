/// Legacy service type still advertised by older images
pub const LEGACY_SERVICE_TYPE: &str = "_https._tcp";

/// Default mDNS domain
pub const DEFAULT_DOMAIN: &str = "local";

/// Port of the k3s API server
pub const DEFAULT_API_PORT: u16 = 6443;

/// TXT record keys used in k3s advertisements
pub const TXT_K3S: &str = "k3s";
pub const TXT_CLUSTER: &str = "cluster";
pub const TXT_ENV: &str = "env";
pub const TXT_ROLE: &str = "role";
pub const TXT_PHASE: &str = "phase";
pub const TXT_LEADER: &str = "leader";
pub const TXT_HOST: &str = "host";
pub const TXT_IP4: &str = "ip4";
pub const TXT_IP6: &str = "ip6";
pub const TXT_STATE: &str = "state";

/// Primary service type for a cluster/environment pair, e.g. `_k3s-sugar-dev._tcp`
pub fn service_type(cluster: &str, env: &str) -> String {
    format!("_k3s-{}-{}._tcp", cluster.to_ascii_lowercase(), env.to_ascii_lowercase())
}

/// Service types to browse, primary first
pub fn service_types(cluster: &str, env: &str) -> Vec<String> {
    let primary = service_type(cluster, env);
    if primary == LEGACY_SERVICE_TYPE {
        vec![primary]
    } else {
        vec![primary, LEGACY_SERVICE_TYPE.to_string()]
    }
}

/// Instance label a node advertises under, e.g. `k3s-sugar-dev@sugarkube0 (bootstrap)`
pub fn instance_name(cluster: &str, env: &str, host: &str, role: &str) -> String {
    format!("k3s-{}-{}@{} ({})", cluster, env, host, role)
}

/// Deterministic fail-open target, `sugarkube<N>.local`
pub fn fallback_host(index: u32) -> String {
    format!("sugarkube{}.local", index)
}
