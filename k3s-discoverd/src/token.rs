use std::collections::HashMap;
use std::path::Path;
use crate::error::{Error, Result};

/// Join token for `env`: `SUGARKUBE_TOKEN_<ENV>`, then `SUGARKUBE_TOKEN`, then
/// the contents of `path`. Blank values are ignored.
pub fn resolve_token(vars: &HashMap<String, String>, env: &str, path: Option<&Path>) -> Result<Option<String>> {
    let scoped = format!("SUGARKUBE_TOKEN_{}", env.to_ascii_uppercase().replace('-', "_"));
    for key in [scoped.as_str(), "SUGARKUBE_TOKEN"] {
        if let Some(value) = vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            tracing::debug!("Using join token from {}", key);
            return Ok(Some(value.to_string()));
        }
    }

    let Some(path) = path else { return Ok(None) };
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let token = contents.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Token file {} does not exist", path.display());
            Ok(None)
        }
        Err(e) => Err(Error::Config(format!("cannot read token file {}: {}", path.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_env_scoped_token_wins() {
        let vars = vars(&[("SUGARKUBE_TOKEN", "generic"), ("SUGARKUBE_TOKEN_DEV", "dev-token")]);
        assert_eq!(resolve_token(&vars, "dev", None).unwrap().as_deref(), Some("dev-token"));
        assert_eq!(resolve_token(&vars, "prod", None).unwrap().as_deref(), Some("generic"));
    }

    #[test]
    fn test_blank_env_falls_through_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-token");
        std::fs::write(&path, "from-file\n").unwrap();

        let vars = vars(&[("SUGARKUBE_TOKEN", "  ")]);
        assert_eq!(resolve_token(&vars, "dev", Some(&path)).unwrap().as_deref(), Some("from-file"));
    }

    #[test]
    fn test_missing_everything_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert_eq!(resolve_token(&HashMap::new(), "dev", Some(&path)).unwrap(), None);
        assert_eq!(resolve_token(&HashMap::new(), "dev", None).unwrap(), None);
    }

    #[test]
    fn test_unreadable_path_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_token(&HashMap::new(), "dev", Some(dir.path())).unwrap_err();
        assert!(err.is_fatal());
    }
}
