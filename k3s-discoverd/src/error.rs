use std::time::Duration;
use thiserror::Error;

/// Failures raised while discovering, electing and joining.
///
/// Only [`Error::InstallFailure`] and [`Error::Config`] end a run; every
/// other variant is retried or degrades to fail-open by the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Discovery command exited non-zero without output (daemon not ready, etc.)
    #[error("discovery command exited with {code:?} and no output: {stderr}")]
    Transient { code: Option<i32>, stderr: String },

    /// Discovery command hit its timeout; `partial` holds whatever it printed first
    #[error("discovery command timed out after {after:?}")]
    Timeout { after: Duration, partial: Vec<String> },

    #[error("malformed record ({reason}): {line}")]
    RecordParse { reason: String, line: String },

    #[error("self-check did not observe {instance} after {attempts} attempts")]
    SelfCheckExhausted { instance: String, attempts: u32 },

    #[error("canonical record still visible at {host}; fail-open deferred")]
    AbsenceGateUnconfirmed { host: String },

    #[error("more than one leader observed: {}", leaders.join(","))]
    ElectionAmbiguous { leaders: Vec<String> },

    #[error("API at {host}:{port} not ready: {detail}")]
    ApiNotReady { host: String, port: u16, detail: String },

    #[error("installer exited with {code:?}: {stderr}")]
    InstallFailure { code: Option<i32>, stderr: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InstallFailure { .. } | Error::Config(_))
    }

    /// Short reason tag used in `event=` lines
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Transient { .. } => "transient",
            Error::Timeout { .. } => "timeout",
            Error::RecordParse { .. } => "record_parse",
            Error::SelfCheckExhausted { .. } => "selfcheck_exhausted",
            Error::AbsenceGateUnconfirmed { .. } => "absence_gate_unconfirmed",
            Error::ElectionAmbiguous { .. } => "election_ambiguous",
            Error::ApiNotReady { .. } => "api_not_ready",
            Error::InstallFailure { .. } => "install_failure",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_install_and_config_are_fatal() {
        assert!(Error::InstallFailure { code: Some(1), stderr: String::new() }.is_fatal());
        assert!(Error::Config("SUGARKUBE_SERVERS".into()).is_fatal());
        assert!(!Error::Transient { code: Some(2), stderr: String::new() }.is_fatal());
        assert!(!Error::ApiNotReady { host: "h".into(), port: 6443, detail: String::new() }.is_fatal());
        assert!(!Error::SelfCheckExhausted { instance: "i".into(), attempts: 3 }.is_fatal());
    }

    #[test]
    fn test_reason_tags() {
        let err = Error::Timeout { after: Duration::from_secs(1), partial: vec![] };
        assert_eq!(err.reason(), "timeout");
        let err = Error::ElectionAmbiguous { leaders: vec!["a".into(), "b".into()] };
        assert_eq!(err.to_string(), "more than one leader observed: a,b");
    }
}
