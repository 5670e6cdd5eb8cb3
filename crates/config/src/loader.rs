use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::RelayConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["relay.toml", "relay.yaml", "relay.yml", "relay.json"];

/// Load and validate config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    let config = parse_config(&raw, path)?;
    config.validate()?;
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./relay.{toml,yaml,yml,json}` (project-local)
/// 2. `<user config dir>/relay/relay.{toml,yaml,yml,json}`
///
/// Returns `RelayConfig::default()` if no config file is found or the file
/// found cannot be loaded.
pub fn discover_and_load() -> RelayConfig {
    load_or_default(find_config_file())
}

fn load_or_default(path: Option<PathBuf>) -> RelayConfig {
    let Some(path) = path else {
        debug!("no config file found, using defaults");
        return RelayConfig::default();
    };

    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            RelayConfig::default()
        },
    }
}

/// Returns the user-global config directory (`~/.config/relay/` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "relay").map(|d| d.config_dir().to_path_buf())
}

fn find_config_file() -> Option<PathBuf> {
    find_in(Path::new(".")).or_else(|| config_dir().and_then(|dir| find_in(&dir)))
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

fn parse_config(raw: &str, path: &Path) -> Result<RelayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "relay.toml",
            r#"
            [providers.anthropic]
            model = "claude-sonnet-4-20250514"

            [agent]
            max_iterations = 4
            "#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.agent.max_iterations, 4);
        assert_eq!(
            cfg.providers.get("anthropic").unwrap().model.as_deref(),
            Some("claude-sonnet-4-20250514")
        );
    }

    #[test]
    fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = write(&dir, "relay.yaml", "agent:\n  thinking_budget: 1024\n");
        assert_eq!(load_config(&yaml).unwrap().agent.thinking_budget, 1024);

        let json = write(&dir, "relay.json", r#"{"agent": {"max_tokens": 8000}}"#);
        assert_eq!(load_config(&json).unwrap().agent.max_tokens, 8000);
    }

    #[test]
    fn unresolved_placeholder_survives_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "relay.toml",
            "[providers.openai]\nbase_url = \"${RELAY_TEST_UNSET_BASE_URL}\"\n",
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(
            cfg.providers.get("openai").unwrap().base_url.as_deref(),
            Some("${RELAY_TEST_UNSET_BASE_URL}")
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "relay.ini", "x=1");
        assert!(matches!(
            load_config(&path),
            Err(Error::UnsupportedFormat(ext)) if ext == "ini"
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/relay.toml"));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "relay.toml", "[agent]\nmax_tokens = 0\n");
        assert!(matches!(load_config(&path), Err(Error::Invalid(_))));
    }

    #[test]
    fn discovery_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_in(dir.path()), None);
        assert_eq!(load_or_default(find_in(dir.path())).agent.max_iterations, 10);

        write(&dir, "relay.yaml", "agent:\n  max_iterations: 0\n");
        let invalid = find_in(dir.path());
        assert!(invalid.is_some());
        assert_eq!(load_or_default(invalid).agent.max_iterations, 10);

        write(&dir, "relay.toml", "[agent]\nmax_iterations = 3\n");
        assert_eq!(load_or_default(find_in(dir.path())).agent.max_iterations, 3);
    }

    #[test]
    fn find_in_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "relay.json", "{}");
        write(&dir, "relay.toml", "");
        let found = find_in(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "relay.toml");
    }
}
