use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec};

/// API endpoint to wait for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Ok once the API answers; `ApiNotReady` otherwise
    async fn check(&self, target: &ProbeTarget) -> Result<()>;
}

/// Runs the readiness probe with `SERVER_HOST`, `SERVER_IP` and `SERVER_PORT`
pub struct CommandProbe {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Option<Duration>,
}

impl CommandProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, program: &str, timeout: Option<Duration>) -> Self {
        Self { runner, program: program.to_string(), timeout }
    }

    fn spec(&self, target: &ProbeTarget) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program)
            .env("SERVER_HOST", &target.host)
            .env("SERVER_PORT", target.port.to_string())
            .timeout(self.timeout);
        if let Some(ip) = target.ip {
            spec = spec.env("SERVER_IP", ip.to_string());
        }
        spec
    }
}

#[async_trait]
impl ReadinessProbe for CommandProbe {
    async fn check(&self, target: &ProbeTarget) -> Result<()> {
        let not_ready = |detail: String| Error::ApiNotReady {
            host: target.host.clone(),
            port: target.port,
            detail,
        };
        let output = self
            .runner
            .run(&self.spec(target))
            .await
            .map_err(|e| not_ready(e.to_string()))?;
        if output.timed_out {
            return Err(not_ready("probe timed out".into()));
        }
        if !output.success() {
            return Err(not_ready(format!("exit {:?}: {}", output.code, output.stderr.trim())));
        }
        Ok(())
    }
}
