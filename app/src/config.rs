use anyhow::{Context, Result};
use directories::ProjectDirs;
use nutrimatch_core::config::Settings;
use std::path::{Path, PathBuf};

const DEFAULT_COMPLETION_URL: &str = "https://api.openai.com/v1";
const DEFAULT_COMPLETION_MODEL: &str = "gpt-4o";

/// Where the completion API lives and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub base_url: String,
    pub token: Option<String>,
}

pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub reference_path: PathBuf,
    pub settings: Settings,
    /// `None` runs matching without the model tier.
    pub completion: Option<CompletionEndpoint>,
    /// `None` keeps every change queued locally.
    pub backend: Option<BackendEndpoint>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "nutrimatch").context("Could not determine home directory")?;
        Self::in_dir(proj_dirs.data_dir(), |key| std::env::var(key).ok())
    }

    /// Resolve paths under `data_dir`, with endpoints read through `env`.
    pub fn in_dir(data_dir: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let settings = read_settings(&data_dir.join("settings.json"))?;
        let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let completion = var("NUTRIMATCH_COMPLETION_API_KEY").map(|api_key| CompletionEndpoint {
            base_url: var("NUTRIMATCH_COMPLETION_URL")
                .unwrap_or_else(|| DEFAULT_COMPLETION_URL.to_string()),
            api_key,
            model: var("NUTRIMATCH_COMPLETION_MODEL")
                .unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string()),
        });
        let backend = var("NUTRIMATCH_BACKEND_URL").map(|base_url| BackendEndpoint {
            base_url,
            token: var("NUTRIMATCH_BACKEND_TOKEN"),
        });

        Ok(Config {
            data_dir: data_dir.to_path_buf(),
            db_path: data_dir.join("nutrimatch.db"),
            reference_path: data_dir.join("reference.db"),
            settings,
            completion,
            backend,
        })
    }
}

fn read_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse settings: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_settings_or_env() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path(), env_of(&[])).unwrap();

        assert_eq!(config.db_path, dir.path().join("nutrimatch.db"));
        assert_eq!(config.reference_path, dir.path().join("reference.db"));
        assert_eq!(config.settings, Settings::default());
        assert!(config.completion.is_none());
        assert!(config.backend.is_none());
    }

    #[test]
    fn test_creates_missing_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let config = Config::in_dir(&nested, env_of(&[])).unwrap();
        assert!(nested.is_dir());
        assert_eq!(config.data_dir, nested);
    }

    #[test]
    fn test_partial_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{"matching": {"llm_similarity_threshold": 0.9}, "sync": {"workers": 4}}"#,
        )
        .unwrap();

        let config = Config::in_dir(dir.path(), env_of(&[])).unwrap();
        assert!((config.settings.matching.llm_similarity_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.settings.matching.candidate_limit, 8);
        assert_eq!(config.settings.sync.workers, 4);
        assert_eq!(config.settings.enrichment.max_attempts, 3);
    }

    #[test]
    fn test_malformed_settings_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "{not json").unwrap();
        let err = Config::in_dir(dir.path(), env_of(&[])).err().unwrap();
        assert!(format!("{err:#}").contains("Failed to parse settings"));
    }

    #[test]
    fn test_completion_endpoint_from_env() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(
            dir.path(),
            env_of(&[("NUTRIMATCH_COMPLETION_API_KEY", "sk-test")]),
        )
        .unwrap();
        let completion = config.completion.unwrap();
        assert_eq!(completion.api_key, "sk-test");
        assert_eq!(completion.base_url, DEFAULT_COMPLETION_URL);
        assert_eq!(completion.model, DEFAULT_COMPLETION_MODEL);

        let config = Config::in_dir(
            dir.path(),
            env_of(&[
                ("NUTRIMATCH_COMPLETION_API_KEY", "sk-test"),
                ("NUTRIMATCH_COMPLETION_URL", "http://localhost:11434/v1"),
                ("NUTRIMATCH_COMPLETION_MODEL", "qwen2.5:7b-instruct"),
            ]),
        )
        .unwrap();
        let completion = config.completion.unwrap();
        assert_eq!(completion.base_url, "http://localhost:11434/v1");
        assert_eq!(completion.model, "qwen2.5:7b-instruct");
    }

    #[test]
    fn test_blank_key_disables_completion() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(
            dir.path(),
            env_of(&[
                ("NUTRIMATCH_COMPLETION_API_KEY", "  "),
                ("NUTRIMATCH_COMPLETION_URL", "http://localhost:11434/v1"),
            ]),
        )
        .unwrap();
        assert!(config.completion.is_none());
    }

    #[test]
    fn test_backend_endpoint_from_env() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(
            dir.path(),
            env_of(&[
                ("NUTRIMATCH_BACKEND_URL", "https://sync.example.com"),
                ("NUTRIMATCH_BACKEND_TOKEN", "tok"),
            ]),
        )
        .unwrap();
        assert_eq!(
            config.backend,
            Some(BackendEndpoint {
                base_url: "https://sync.example.com".to_string(),
                token: Some("tok".to_string()),
            })
        );
    }
}
