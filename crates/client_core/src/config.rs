use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::upload::DEFAULT_MAX_UPLOAD_BYTES;

pub const DEFAULT_CONFIG_FILE: &str = "builder.toml";

/// What the controller does with a network intent issued while another one
/// is still awaiting its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Let both calls run; whichever response resolves last wins.
    #[default]
    Race,
    /// Refuse the second intent locally.
    Reject,
}

impl FromStr for InFlightPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "race" | "last_write_wins" => Ok(InFlightPolicy::Race),
            "reject" => Ok(InFlightPolicy::Reject),
            other => Err(format!("unknown in-flight policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_upload_bytes: u64,
    pub in_flight_policy: InFlightPolicy,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api/v1/project-builder".into(),
            request_timeout_secs: 30,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            in_flight_policy: InFlightPolicy::Race,
            snapshot_path: None,
        }
    }
}

impl ClientSettings {
    pub fn base_url(&self) -> anyhow::Result<Url> {
        let url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid base url '{}'", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("base url must start with http:// or https://");
        }
        Ok(url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    max_upload_bytes: Option<u64>,
    in_flight_policy: Option<InFlightPolicy>,
    snapshot_path: Option<PathBuf>,
}

/// Defaults, then the TOML file at `path` if it exists, then environment.
pub fn load_settings(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "config: ignoring unreadable file"
            ),
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.base_url {
        settings.base_url = v;
    }
    if let Some(v) = file_cfg.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = file_cfg.max_upload_bytes {
        settings.max_upload_bytes = v;
    }
    if let Some(v) = file_cfg.in_flight_policy {
        settings.in_flight_policy = v;
    }
    if let Some(v) = file_cfg.snapshot_path {
        settings.snapshot_path = Some(v);
    }
}

fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    for key in ["BUILDER_BASE_URL", "APP__BASE_URL"] {
        if let Some(v) = lookup(key) {
            if Url::parse(&v).is_ok() {
                settings.base_url = v;
            } else {
                warn!(key, value = %v, "config: ignoring invalid url");
            }
        }
    }

    if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.request_timeout_secs = parsed,
            Err(_) => warn!(value = %v, "config: ignoring invalid APP__REQUEST_TIMEOUT_SECS"),
        }
    }

    if let Some(v) = lookup("APP__MAX_UPLOAD_BYTES") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.max_upload_bytes = parsed,
            Err(_) => warn!(value = %v, "config: ignoring invalid APP__MAX_UPLOAD_BYTES"),
        }
    }

    if let Some(v) = lookup("APP__IN_FLIGHT_POLICY") {
        match v.parse::<InFlightPolicy>() {
            Ok(parsed) => settings.in_flight_policy = parsed,
            Err(err) => warn!(error = %err, "config: ignoring APP__IN_FLIGHT_POLICY"),
        }
    }

    if let Some(v) = lookup("APP__SNAPSHOT_PATH") {
        settings.snapshot_path = (!v.trim().is_empty()).then(|| PathBuf::from(v));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(
            &path,
            concat!(
                "base_url = \"https://lms.example.edu/api\"\n",
                "in_flight_policy = \"reject\"\n",
                "request_timeout_secs = 5\n",
            ),
        )
        .expect("write config");

        let mut settings = ClientSettings::default();
        let file_cfg = toml::from_str::<FileSettings>(&fs::read_to_string(&path).expect("read"))
            .expect("parse");
        apply_file(&mut settings, file_cfg);

        assert_eq!(settings.base_url, "https://lms.example.edu/api");
        assert_eq!(settings.in_flight_policy, InFlightPolicy::Reject);
        assert_eq!(settings.request_timeout(), Duration::from_secs(5));
        assert_eq!(settings.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    }

    #[test]
    fn env_overrides_and_skips_invalid_values() {
        let mut settings = ClientSettings::default();
        apply_env(
            &mut settings,
            env(&[
                ("APP__BASE_URL", "https://staging.example.edu/builder"),
                ("APP__REQUEST_TIMEOUT_SECS", "soon"),
                ("APP__IN_FLIGHT_POLICY", "Reject"),
                ("APP__SNAPSHOT_PATH", "/tmp/session.json"),
            ]),
        );

        assert_eq!(settings.base_url, "https://staging.example.edu/builder");
        assert_eq!(settings.request_timeout_secs, 30);
        assert_eq!(settings.in_flight_policy, InFlightPolicy::Reject);
        assert_eq!(
            settings.snapshot_path,
            Some(PathBuf::from("/tmp/session.json"))
        );
    }

    #[test]
    fn invalid_env_url_keeps_previous_value() {
        let mut settings = ClientSettings::default();
        apply_env(&mut settings, env(&[("BUILDER_BASE_URL", "not a url")]));
        assert_eq!(settings.base_url, ClientSettings::default().base_url);
    }

    #[test]
    fn base_url_requires_http_scheme() {
        let settings = ClientSettings {
            base_url: "ftp://example.edu".into(),
            ..ClientSettings::default()
        };
        assert!(settings.base_url().is_err());
        assert!(ClientSettings::default().base_url().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults_plus_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&dir.path().join("absent.toml"));
        assert_eq!(settings.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let settings = ClientSettings {
            request_timeout_secs: 0,
            ..ClientSettings::default()
        };
        assert_eq!(settings.request_timeout(), Duration::from_secs(1));
    }
}
