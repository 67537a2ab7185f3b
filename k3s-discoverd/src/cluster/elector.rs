use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec};

/// Result of one leader-election round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    pub winner: bool,
    /// Opaque tie-break key reported by the helper
    pub key: String,
}

/// Advisory leader election. The answer is a recommendation; callers must
/// tolerate more than one node believing it won.
#[async_trait]
pub trait Elector: Send + Sync {
    async fn elect(&self) -> Result<Election>;
}

/// Parse `winner=yes|no` and `key=<token>` lines. Missing winner reads as no.
pub fn parse_election(stdout: &str) -> Election {
    let mut election = Election { winner: false, key: String::new() };
    for line in stdout.lines() {
        match line.trim().split_once('=') {
            Some(("winner", value)) => election.winner = value.trim().eq_ignore_ascii_case("yes"),
            Some(("key", value)) => election.key = value.trim().to_string(),
            _ => {}
        }
    }
    election
}

/// Runs the election helper executable
pub struct CommandElector {
    runner: Arc<dyn CommandRunner>,
    spec: CommandSpec,
}

impl CommandElector {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: &str,
        cluster: &str,
        env: &str,
        servers: u32,
        timeout: Option<Duration>,
    ) -> Self {
        let spec = CommandSpec::new(program)
            .env("SUGARKUBE_CLUSTER", cluster)
            .env("SUGARKUBE_ENV", env)
            .env("SUGARKUBE_SERVERS", servers.to_string())
            .timeout(timeout);
        Self { runner, spec }
    }
}

#[async_trait]
impl Elector for CommandElector {
    async fn elect(&self) -> Result<Election> {
        let output = self.runner.run(&self.spec).await?;
        if !output.success() {
            return Err(Error::Transient { code: output.code, stderr: output.stderr.trim().to_string() });
        }
        Ok(parse_election(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    #[test]
    fn test_parse_election() {
        let election = parse_election("debug noise\nwinner=yes\nkey=0003:sugarkube2\n");
        assert_eq!(election, Election { winner: true, key: "0003:sugarkube2".into() });
        assert!(!parse_election("winner=no\n").winner);
        assert!(!parse_election("").winner);
    }

    #[tokio::test]
    async fn test_command_elector_env_and_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_stdout(0, "winner=yes\nkey=abc\n");
        runner.push_stdout(2, "");
        let elector = CommandElector::new(runner.clone(), "elect_leader.sh", "sugar", "dev", 3, None);

        assert!(elector.elect().await.unwrap().winner);
        assert!(matches!(elector.elect().await, Err(Error::Transient { code: Some(2), .. })));

        let call = &runner.calls()[0];
        assert_eq!(call.program, "elect_leader.sh");
        assert_eq!(call.env_value("SUGARKUBE_SERVERS"), Some("3"));
    }
}
