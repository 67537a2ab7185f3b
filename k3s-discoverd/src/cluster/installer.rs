use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// First control-plane node
    ClusterInit,
    /// Additional control-plane node
    Server,
    Agent,
}

impl JoinMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinMode::ClusterInit => "cluster-init",
            JoinMode::Server => "server",
            JoinMode::Agent => "agent",
        }
    }

    /// Mode for a node joining an existing cluster of `servers` control planes
    pub fn for_join(servers: u32) -> Self {
        if servers > 1 {
            JoinMode::Server
        } else {
            JoinMode::Agent
        }
    }
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub mode: JoinMode,
    /// `https://<host>:<port>`; absent for cluster-init
    pub url: Option<String>,
    pub token: Option<String>,
    pub server_ip: Option<Ipv4Addr>,
}

/// Installs or joins k3s. Must be idempotent: re-running against an already
/// joined node succeeds.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, request: &InstallRequest) -> Result<()>;
}

pub struct CommandInstaller {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Option<Duration>,
}

impl CommandInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>, program: &str, timeout: Option<Duration>) -> Self {
        Self { runner, program: program.to_string(), timeout }
    }

    fn spec(&self, request: &InstallRequest) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program)
            .arg(request.mode.as_str())
            .env("MODE", request.mode.as_str())
            .timeout(self.timeout);
        if let Some(url) = &request.url {
            spec = spec.env("K3S_URL", url);
        }
        if let Some(token) = &request.token {
            spec = spec.env("TOKEN", token).env("K3S_TOKEN", token);
        }
        if let Some(ip) = request.server_ip {
            spec = spec.env("SERVER_IP", ip.to_string());
        }
        spec
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(&self, request: &InstallRequest) -> Result<()> {
        tracing::info!(
            "Running {} mode={} url={}",
            self.program,
            request.mode,
            request.url.as_deref().unwrap_or("-")
        );
        let output = self.runner.run(&self.spec(request)).await.map_err(|e| Error::InstallFailure {
            code: None,
            stderr: e.to_string(),
        })?;
        if !output.success() {
            let stderr = if output.timed_out { "installer timed out".to_string() } else { output.stderr.trim().to_string() };
            return Err(Error::InstallFailure { code: output.code, stderr });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    #[test]
    fn test_join_mode_by_server_count() {
        assert_eq!(JoinMode::for_join(1), JoinMode::Agent);
        assert_eq!(JoinMode::for_join(3), JoinMode::Server);
        assert_eq!(JoinMode::ClusterInit.to_string(), "cluster-init");
    }

    #[tokio::test]
    async fn test_installer_interface() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_stdout(0, "");
        let installer = CommandInstaller::new(runner.clone(), "k3s-install.sh", None);
        let request = InstallRequest {
            mode: JoinMode::Server,
            url: Some("https://sugarkube0.local:6443".into()),
            token: Some("secret".into()),
            server_ip: Some(Ipv4Addr::new(192, 0, 2, 1)),
        };
        installer.install(&request).await.unwrap();

        let call = &runner.calls()[0];
        assert_eq!(call.argv(), vec!["k3s-install.sh", "server"]);
        assert_eq!(call.env_value("MODE"), Some("server"));
        assert_eq!(call.env_value("K3S_URL"), Some("https://sugarkube0.local:6443"));
        assert_eq!(call.env_value("TOKEN"), Some("secret"));
        assert_eq!(call.env_value("K3S_TOKEN"), Some("secret"));
        assert_eq!(call.env_value("SERVER_IP"), Some("192.0.2.1"));
    }

    #[tokio::test]
    async fn test_installer_failure_is_fatal() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_output(crate::exec::CommandOutput { code: Some(1), stderr: "boom\n".into(), ..Default::default() });
        let installer = CommandInstaller::new(runner.clone(), "k3s-install.sh", None);
        let request = InstallRequest { mode: JoinMode::ClusterInit, url: None, token: None, server_ip: None };

        let err = installer.install(&request).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::InstallFailure { code: Some(1), ref stderr } if stderr == "boom"));
        assert_eq!(runner.calls()[0].env_value("K3S_URL"), None);
    }
}
