//! Service configuration.
//!
//! Values come from environment variables. When `PROMOREEL_CONFIG` names a
//! JSON file, its keys (same names as the variables) supply defaults that the
//! environment can still override.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::job::RenderMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub const DEFAULT_FIRECRAWL_ENDPOINT: &str = "https://api.firecrawl.dev/v1/scrape";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o";
pub const DEFAULT_ELEVENLABS_VOICE_ID: &str = "EXAVITQu4vr4xnSDxMaL";

/// Credentials and endpoints of external providers.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub firecrawl_api_key: Option<String>,
    pub firecrawl_endpoint: String,
    pub browser_use_api_key: Option<String>,
    pub browser_use_endpoint: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub llm_model: String,
    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_voice_id: String,
    /// Directory holding `background_{style}.mp3` loops.
    pub music_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Mode used when a submission does not pick one.
    pub render_mode: RenderMode,
    /// Job store file and per-job intermediate outputs.
    pub data_dir: PathBuf,
    /// Published artifacts, served under `/outputs`.
    pub outputs_dir: PathBuf,
    /// Template project cloned into every workspace.
    pub template_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    /// Name of the dependency cache directory inside the template; linked, never copied.
    pub dependency_cache: String,
    pub generator_program: String,
    pub render_program: String,
    pub generation_timeout: Duration,
    pub render_timeout: Duration,
    pub adapter_max_attempts: u32,
    /// Keep only the newest N workspaces. `None` deletes on success and keeps failures.
    pub workspace_keep_last: Option<usize>,
    pub providers: ProviderConfig,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        let file_values = match std::env::var("PROMOREEL_CONFIG") {
            Ok(path) if !path.trim().is_empty() => load_file_values(Path::new(&path))?,
            _ => HashMap::new(),
        };
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_values.get(key).cloned())
        })
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let home = get("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

        let render_mode = match get("RENDER_MODE") {
            Some(v) => v.parse().map_err(|message| ConfigError::Invalid {
                key: "RENDER_MODE",
                message,
            })?,
            None => RenderMode::default(),
        };

        let workspace_keep_last = match get("WORKSPACE_KEEP_LAST") {
            Some(v) => Some(parse_number::<usize>("WORKSPACE_KEEP_LAST", &v)?),
            None => None,
        };

        let adapter_max_attempts = parse_or("ADAPTER_MAX_ATTEMPTS", get("ADAPTER_MAX_ATTEMPTS"), 3u32)?;
        if adapter_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "ADAPTER_MAX_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or("PORT", get("PORT"), 8000u16)?,
            render_mode,
            data_dir: get("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            outputs_dir: get("OUTPUTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("outputs")),
            template_dir: get("REMOTION_PROJECT_DIR")
                .map(|p| expand_home(&p, &home))
                .unwrap_or_else(|| home.join("remotion-demo-2")),
            workspaces_dir: get("WORKSPACES_DIR")
                .map(|p| expand_home(&p, &home))
                .unwrap_or_else(|| home.join(".remotion-agentic")),
            dependency_cache: get("DEPENDENCY_CACHE").unwrap_or_else(|| "node_modules".to_string()),
            generator_program: get("GENERATOR_PROGRAM").unwrap_or_else(|| "cline".to_string()),
            render_program: get("RENDER_PROGRAM").unwrap_or_else(|| "npx".to_string()),
            generation_timeout: Duration::from_secs(parse_or(
                "GENERATION_TIMEOUT_SECS",
                get("GENERATION_TIMEOUT_SECS"),
                900u64,
            )?),
            render_timeout: Duration::from_secs(parse_or(
                "RENDER_TIMEOUT_SECS",
                get("RENDER_TIMEOUT_SECS"),
                600u64,
            )?),
            adapter_max_attempts,
            workspace_keep_last,
            providers: ProviderConfig {
                firecrawl_api_key: get("FIRECRAWL_API_KEY"),
                firecrawl_endpoint: get("FIRECRAWL_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_FIRECRAWL_ENDPOINT.to_string()),
                browser_use_api_key: get("BROWSER_USE_API_KEY"),
                browser_use_endpoint: get("BROWSER_USE_ENDPOINT"),
                openai_api_key: get("OPENAI_API_KEY"),
                openai_base_url: get("OPENAI_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                llm_model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
                elevenlabs_api_key: get("ELEVENLABS_API_KEY"),
                elevenlabs_voice_id: get("ELEVENLABS_VOICE_ID")
                    .unwrap_or_else(|| DEFAULT_ELEVENLABS_VOICE_ID.to_string()),
                music_dir: get("MUSIC_DIR").map(|p| expand_home(&p, &home)),
            },
        })
    }

    /// Where the job store snapshot lives.
    pub fn jobs_file(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    /// Directory for one job's intermediate outputs.
    pub fn job_data_dir(&self, job_id: uuid::Uuid) -> PathBuf {
        self.data_dir.join("jobs").join(job_id.to_string())
    }
}

fn load_file_values(path: &Path) -> ConfigResult<HashMap<String, String>> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: HashMap<String, serde_json::Value> =
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            serde_json::Value::Number(n) => Some((k, n.to_string())),
            serde_json::Value::Bool(b) => Some((k, b.to_string())),
            _ => None,
        })
        .collect())
}

fn parse_number<T>(key: &'static str, value: &str) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        message: format!("'{}': {}", value, e),
    })
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(v) => parse_number(key, &v),
        None => Ok(default),
    }
}

fn expand_home(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[("HOME", "/home/demo")])).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.render_mode, RenderMode::Templated);
        assert_eq!(config.template_dir, PathBuf::from("/home/demo/remotion-demo-2"));
        assert_eq!(config.workspaces_dir, PathBuf::from("/home/demo/.remotion-agentic"));
        assert_eq!(config.generation_timeout, Duration::from_secs(900));
        assert_eq!(config.dependency_cache, "node_modules");
        assert_eq!(config.adapter_max_attempts, 3);
        assert!(config.workspace_keep_last.is_none());
        assert_eq!(config.providers.llm_model, "gpt-4o");
    }

    #[test]
    fn test_overrides_and_home_expansion() {
        let config = Config::from_lookup(lookup_from(&[
            ("HOME", "/home/demo"),
            ("RENDER_MODE", "agentic"),
            ("PORT", "9100"),
            ("REMOTION_PROJECT_DIR", "~/projects/promo"),
            ("GENERATION_TIMEOUT_SECS", "30"),
            ("WORKSPACE_KEEP_LAST", "5"),
        ]))
        .unwrap();
        assert_eq!(config.render_mode, RenderMode::Agentic);
        assert_eq!(config.port, 9100);
        assert_eq!(config.template_dir, PathBuf::from("/home/demo/projects/promo"));
        assert_eq!(config.generation_timeout, Duration::from_secs(30));
        assert_eq!(config.workspace_keep_last, Some(5));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[("RENDER_MODE", "cinematic")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "RENDER_MODE", .. }));

        let err = Config::from_lookup(lookup_from(&[("GENERATION_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "GENERATION_TIMEOUT_SECS", .. }));

        let err = Config::from_lookup(lookup_from(&[("ADAPTER_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ADAPTER_MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn test_file_values_accept_numbers() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("promoreel.json");
        std::fs::write(&path, r#"{"PORT": 7000, "RENDER_MODE": "agentic", "nested": {"x": 1}}"#)
            .unwrap();

        let values = load_file_values(&path).unwrap();
        assert_eq!(values.get("PORT").map(String::as_str), Some("7000"));
        assert_eq!(values.get("RENDER_MODE").map(String::as_str), Some("agentic"));
        assert!(!values.contains_key("nested"));
    }
}
