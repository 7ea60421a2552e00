use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use quill_llm::{DEFAULT_HTTP_ENDPOINT, DEFAULT_OPENAI_MODEL, HTTP_BODY_SOURCE_ID, SourceConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::{DEFAULT_SUGGESTIONS, RevealPacing, SessionOptions};

pub const SETTINGS_DIRECTORY_NAME: &str = "quill";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DEFAULT_STARTER_PROMPTS: [&str; 4] = [
    "How can you help me today?",
    "Tell me about your features",
    "What can you do?",
    "Give me some examples",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealSettings {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RevealSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RevealSettings {
    fn normalized(self) -> Self {
        Self {
            min_delay_ms: self.min_delay_ms.min(self.max_delay_ms),
            max_delay_ms: self.min_delay_ms.max(self.max_delay_ms),
        }
    }

    pub fn pacing(&self) -> RevealPacing {
        RevealPacing::from_millis(self.min_delay_ms, self.max_delay_ms)
    }
}

/// Assistant message shown before the first submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub text: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_source_kind")]
    pub source_kind: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub preamble: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub reveal: RevealSettings,
    #[serde(default = "default_suggestions")]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub greeting: Option<Greeting>,
    /// Prompts offered before the first question, picked with `/try N`.
    #[serde(default = "default_starter_prompts")]
    pub starter_prompts: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source_kind: default_source_kind(),
            endpoint: default_endpoint(),
            api_key: String::new(),
            model: default_model(),
            preamble: None,
            request_timeout_secs: None,
            reveal: RevealSettings::default(),
            suggestions: default_suggestions(),
            greeting: None,
            starter_prompts: default_starter_prompts(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.source_kind = non_blank_or(self.source_kind, default_source_kind);
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.api_key = self.api_key.trim().to_string();
        self.model = non_blank_or(self.model, default_model);
        self.preamble = self
            .preamble
            .map(|preamble| preamble.trim().to_string())
            .filter(|preamble| !preamble.is_empty());
        self.request_timeout_secs = self.request_timeout_secs.filter(|secs| *secs > 0);
        self.reveal = self.reveal.normalized();
        self.suggestions = trimmed_non_blank(self.suggestions);
        self.starter_prompts = trimmed_non_blank(self.starter_prompts);
        self.greeting = self
            .greeting
            .filter(|greeting| !greeting.text.trim().is_empty());

        self
    }

    /// Applies `QUILL_*` variables, falling back to `OPENAI_API_KEY` for the key.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(api_key) = lookup("QUILL_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.api_key = api_key;
        }
        if let Some(endpoint) = lookup("QUILL_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(model) = lookup("QUILL_MODEL") {
            self.model = model;
        }
        if let Some(source_kind) = lookup("QUILL_SOURCE") {
            self.source_kind = source_kind;
        }

        self
    }

    pub fn to_source_config(&self) -> SourceConfig {
        let config = SourceConfig::new(&self.source_kind, &self.api_key, &self.endpoint);
        match self.request_timeout_secs {
            Some(secs) => config.with_request_timeout_secs(secs),
            None => config,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            model_id: self.model.clone(),
            preamble: self.preamble.clone(),
            pacing: self.reveal.pacing(),
            suggestions: self.suggestions.clone(),
            reveal_seed: None,
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".quill"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
            return Settings::default();
        }

        let figment =
            Figment::from(Serialized::defaults(Settings::default())).merge(Json::file(path));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, %error, "failed to parse settings, using defaults");
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}

fn default_source_kind() -> String {
    HTTP_BODY_SOURCE_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_HTTP_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_suggestions() -> Vec<String> {
    DEFAULT_SUGGESTIONS.map(str::to_string).to_vec()
}

fn default_starter_prompts() -> Vec<String> {
    DEFAULT_STARTER_PROMPTS.map(str::to_string).to_vec()
}

fn trimmed_non_blank(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn default_min_delay_ms() -> u64 {
    20
}

fn default_max_delay_ms() -> u64 {
    50
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));

        let settings = store.settings();
        assert_eq!(*settings, Settings::default());
        assert_eq!(settings.endpoint, DEFAULT_HTTP_ENDPOINT);
        assert_eq!(settings.reveal.pacing().min_delay(), Duration::from_millis(20));
        assert_eq!(settings.reveal.pacing().max_delay(), Duration::from_millis(50));
        assert_eq!(
            settings.starter_prompts,
            vec![
                "How can you help me today?",
                "Tell me about your features",
                "What can you do?",
                "Give me some examples",
            ]
        );
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "model": " gpt-4.1 ", "reveal": { "min_delay_ms": 80, "max_delay_ms": 10 },
                 "greeting": { "text": "Hi!" } }"#,
        )
        .unwrap();

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.model, "gpt-4.1");
        assert_eq!(settings.source_kind, HTTP_BODY_SOURCE_ID);
        assert_eq!(settings.reveal, RevealSettings { min_delay_ms: 10, max_delay_ms: 80 });
        assert_eq!(settings.suggestions, default_suggestions());
        assert_eq!(
            settings.greeting,
            Some(Greeting {
                text: "Hi!".to_string(),
                suggestions: Vec::new(),
            })
        );
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(*SettingsStore::new(path).settings(), Settings::default());
    }

    #[test]
    fn update_persists_normalized_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        store
            .update(Settings {
                endpoint: "  ".to_string(),
                api_key: " sk-test ".to_string(),
                suggestions: vec![" Why? ".to_string(), String::new()],
                starter_prompts: vec!["  ".to_string(), " Who are you? ".to_string()],
                ..Settings::default()
            })
            .unwrap();

        assert_eq!(store.settings().api_key, "sk-test");
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(reloaded.endpoint, DEFAULT_HTTP_ENDPOINT);
        assert_eq!(reloaded.api_key, "sk-test");
        assert_eq!(reloaded.suggestions, vec!["Why?".to_string()]);
        assert_eq!(reloaded.starter_prompts, vec!["Who are you?".to_string()]);
    }

    #[test]
    fn environment_overrides_take_precedence() {
        let env = HashMap::from([
            ("OPENAI_API_KEY", "sk-openai"),
            ("QUILL_MODEL", " gpt-4.1-mini "),
            ("QUILL_SOURCE", "openai"),
            ("QUILL_ENDPOINT", ""),
        ]);

        let settings = Settings::default()
            .with_overrides(|name| env.get(name).map(|value| value.to_string()));
        assert_eq!(settings.api_key, "sk-openai");
        assert_eq!(settings.model, "gpt-4.1-mini");
        assert_eq!(settings.source_kind, "openai");
        assert_eq!(settings.endpoint, DEFAULT_HTTP_ENDPOINT);

        let env = HashMap::from([("QUILL_API_KEY", "sk-quill"), ("OPENAI_API_KEY", "sk-openai")]);
        let settings = Settings::default()
            .with_overrides(|name| env.get(name).map(|value| value.to_string()));
        assert_eq!(settings.api_key, "sk-quill");
    }

    #[test]
    fn converts_into_source_config_and_session_options() {
        let settings = Settings {
            request_timeout_secs: Some(30),
            preamble: Some("Be brief.".to_string()),
            ..Settings::default()
        };

        let config = settings.to_source_config();
        assert_eq!(config.source_kind, HTTP_BODY_SOURCE_ID);
        assert_eq!(config.request_timeout_secs, Some(30));

        let options = settings.session_options();
        assert_eq!(options.model_id, DEFAULT_OPENAI_MODEL);
        assert_eq!(options.preamble.as_deref(), Some("Be brief."));
        assert_eq!(options.suggestions.len(), 3);
    }
}
