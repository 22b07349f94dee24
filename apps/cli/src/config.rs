use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use serde::Deserialize;
use url::Url;

const DEFAULT_CONFIG_FILE: &str = "parenzing.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub session_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".into(),
            request_timeout_secs: 30,
            session_path: default_session_path(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    api_base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    session_path: Option<PathBuf>,
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = file.session_path {
            self.session_path = v;
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("PARENZING_API_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("APP__API_BASE_URL") {
            self.api_base_url = v;
        }

        if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("APP__REQUEST_TIMEOUT_SECS is not a number: '{v}'"))?;
        }

        if let Some(v) = lookup("APP__SESSION_PATH") {
            self.session_path = PathBuf::from(v);
        }
        Ok(())
    }
}

/// Defaults, then the config file, then environment. An explicitly named
/// config file must exist; the default one is optional.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    load_settings_with(config_path, |key| std::env::var(key).ok())
}

fn load_settings_with(
    config_path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    match fs::read_to_string(&path) {
        Ok(raw) => {
            let file: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
            settings.apply_file(file);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound && config_path.is_none() => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    }

    settings.apply_env(lookup)?;
    settings.api_base_url = normalize_base_url(&settings.api_base_url)?;
    Ok(settings)
}

pub fn normalize_base_url(raw: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(raw.trim())
        .with_context(|| format!("invalid api base url '{}'", raw.trim()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("api base url must use http or https, got '{}'", parsed.scheme());
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn default_session_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parenzing")
        .join("session.json")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn file_values_are_overridden_by_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("parenzing.toml");
        fs::write(
            &path,
            "api_base_url = \"https://file.example.com/\"\nrequest_timeout_secs = 5\n",
        )
        .expect("write config");

        let settings = load_settings_with(Some(path.as_path()), env(&[])).expect("file only");
        assert_eq!(settings.api_base_url, "https://file.example.com");
        assert_eq!(settings.request_timeout_secs, 5);

        let settings = load_settings_with(
            Some(path.as_path()),
            env(&[
                ("PARENZING_API_URL", "http://legacy.example.com"),
                ("APP__API_BASE_URL", "https://api.example.com/v1/"),
                ("APP__SESSION_PATH", "/tmp/pz-session.json"),
            ]),
        )
        .expect("env override");
        assert_eq!(settings.api_base_url, "https://api.example.com/v1");
        assert_eq!(settings.session_path, PathBuf::from("/tmp/pz-session.json"));
    }

    #[test]
    fn explicit_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_settings_with(Some(dir.path().join("absent.toml").as_path()), env(&[]))
            .expect_err("missing file");
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn rejects_non_http_base_url_and_bad_timeout() {
        assert!(normalize_base_url("ftp://example.com").is_err());
        assert!(normalize_base_url("not a url").is_err());

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.toml");
        fs::write(&path, "").expect("write");
        let err = load_settings_with(
            Some(path.as_path()),
            env(&[("APP__REQUEST_TIMEOUT_SECS", "soon")]),
        )
        .expect_err("bad timeout");
        assert!(err.to_string().contains("APP__REQUEST_TIMEOUT_SECS"));
    }

    #[test]
    fn timeout_never_drops_to_zero() {
        let settings = Settings {
            request_timeout_secs: 0,
            ..Settings::default()
        };
        assert_eq!(settings.request_timeout(), Duration::from_secs(1));
    }
}
