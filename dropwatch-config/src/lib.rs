//! Loading of [`DropwatchConfig`] from the environment, files or inline JSON.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use dropwatch_core::DropwatchConfig;
use tracing::debug;

/// Variable naming a TOML or JSON config file.
pub const CONFIG_PATH_VAR: &str = "DROPWATCH_CONFIG_PATH";
/// Variable holding the whole config as inline JSON.
pub const CONFIG_JSON_VAR: &str = "DROPWATCH_CONFIG_JSON";

const DEFAULT_FILES: &[&str] = &[
    "dropwatch.toml",
    "dropwatch.json",
    "config/dropwatch.toml",
    "config/dropwatch.json",
];

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Load configuration using environment variables.
/// Evaluation order:
/// 1) `$DROPWATCH_CONFIG_PATH` (TOML or JSON file),
/// 2) `$DROPWATCH_CONFIG_JSON` (inline JSON),
/// 3) `dropwatch.toml` / `dropwatch.json` in the working directory or its
///    `config/` sub-directory,
/// 4) defaults.
pub fn load_from_env() -> anyhow::Result<(DropwatchConfig, ConfigSource)> {
    let cwd = env::current_dir().context("failed to resolve working directory")?;
    load_with(|key| env::var(key).ok(), &cwd)
}

/// [`load_from_env`] with an explicit variable lookup and base directory.
pub fn load_with<F>(lookup: F, base: &Path) -> anyhow::Result<(DropwatchConfig, ConfigSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path_str) = lookup(CONFIG_PATH_VAR)
        && !path_str.trim().is_empty()
    {
        let path = PathBuf::from(path_str.trim());
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::EnvPath(path)));
    }

    if let Some(raw) = lookup(CONFIG_JSON_VAR)
        && !raw.trim().is_empty()
    {
        let parsed = parse_json(&raw).with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
        return Ok((parsed, ConfigSource::EnvInline));
    }

    if let Some(path) = find_default_file(base) {
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::File(path)));
    }

    debug!("no configuration found, using defaults");
    Ok((DropwatchConfig::default(), ConfigSource::Default))
}

pub fn load_from_file(path: &Path) -> anyhow::Result<DropwatchConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read dropwatch config from {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            parse_json(&contents).with_context(|| format!("invalid dropwatch config {}", path.display()))
        }
        Some("toml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid dropwatch config {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Try TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<DropwatchConfig> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse dropwatch config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<DropwatchConfig> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid dropwatch config json: {err}"))
}

/// Render `config` as TOML, e.g. to seed a config file.
pub fn render_toml(config: &DropwatchConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).context("failed to render dropwatch config as toml")
}

fn find_default_file(base: &Path) -> Option<PathBuf> {
    DEFAULT_FILES
        .iter()
        .map(|candidate| base.join(candidate))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use dropwatch_core::ArchiveKind;

    use super::*;

    fn vars(pairs: &[(&str, String)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, source) = load_with(vars(&[]), tmp.path()).unwrap();
        assert_eq!(source, ConfigSource::Default);
        assert_eq!(config.stability.max_checks, 30);
    }

    #[test]
    fn env_path_wins_over_inline_and_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let explicit = tmp.path().join("explicit.toml");
        fs::write(&explicit, "[watch]\ndirectory = \"/srv/explicit\"\n").unwrap();
        fs::write(tmp.path().join("dropwatch.toml"), "[watch]\nrecursive = true\n").unwrap();

        let lookup = vars(&[
            (CONFIG_PATH_VAR, explicit.display().to_string()),
            (CONFIG_JSON_VAR, r#"{"watch":{"directory":"/srv/inline"}}"#.to_string()),
        ]);
        let (config, source) = load_with(lookup, tmp.path()).unwrap();

        assert_eq!(source, ConfigSource::EnvPath(explicit));
        assert_eq!(config.watch.directory, PathBuf::from("/srv/explicit"));
        assert!(!config.watch.recursive);
    }

    #[test]
    fn inline_json_then_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("dropwatch.toml"),
            "[extraction]\ndefault_size_ceiling_bytes = 1024\n",
        )
        .unwrap();

        let lookup = vars(&[(
            CONFIG_JSON_VAR,
            r#"{"stability":{"poll_interval_ms":250}}"#.to_string(),
        )]);
        let (inline, source) = load_with(lookup, tmp.path()).unwrap();
        assert_eq!(source, ConfigSource::EnvInline);
        assert_eq!(inline.stability.poll_interval_ms, 250);

        let (file, source) = load_with(vars(&[]), tmp.path()).unwrap();
        assert_eq!(source, ConfigSource::File(tmp.path().join("dropwatch.toml")));
        assert_eq!(
            file.extraction.ceiling_for(ArchiveKind::SevenZip, true),
            Some(1024)
        );
    }

    #[test]
    fn extensionless_file_accepts_either_format() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dropwatch.conf");
        fs::write(&path, r#"{"watch":{"max_depth":1}}"#).unwrap();
        assert_eq!(load_from_file(&path).unwrap().watch.max_depth, 1);

        fs::write(&path, "watch = [").unwrap();
        let err = load_from_file(&path).unwrap_err().to_string();
        assert!(err.contains("toml error"));
    }

    #[test]
    fn rendered_defaults_parse_back() {
        let rendered = render_toml(&DropwatchConfig::default()).unwrap();
        let parsed = parse_from_str(&rendered, "rendered").unwrap();
        assert_eq!(parsed.watch.reconcile_interval_ms, 5_000);
        assert_eq!(parsed.extraction.channel_capacity, 8);
    }
}
