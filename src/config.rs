use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service-wide settings, loaded from a TOML file. Secrets (provider API
/// keys) are referenced by environment-variable name and resolved at wiring
/// time, never stored in the file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub group_access: GroupAccessSettings,
    pub auto_analysis: AutoAnalysisSettings,
    pub analysis: AnalysisSettings,
    pub llm: LlmSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupAccessSettings {
    /// "whitelist", "blacklist" or "none".
    pub mode: String,
    pub list: Vec<String>,
}

impl Default for GroupAccessSettings {
    fn default() -> Self {
        Self {
            mode: "none".to_string(),
            list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoAnalysisSettings {
    pub enabled: bool,
    /// Wall-clock "HH:MM", local time.
    pub time: String,
    /// Bot account ids, excluded from history and statistics.
    pub bot_ids: Vec<String>,
}

impl Default for AutoAnalysisSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            time: "09:00".to_string(),
            bot_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub days: i64,
    pub max_messages: usize,
    pub min_messages_threshold: usize,
    pub max_concurrent_tasks: usize,
    pub history_filters: HistoryFilterSettings,
    pub topic: TopicSettings,
    pub user_title: UserTitleSettings,
    pub golden_quote: GoldenQuoteSettings,
    pub dialogue_poll: DialoguePollSettings,
    pub personal_report: PersonalReportSettings,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            days: 1,
            max_messages: 1000,
            min_messages_threshold: 50,
            max_concurrent_tasks: 5,
            history_filters: HistoryFilterSettings::default(),
            topic: TopicSettings::default(),
            user_title: UserTitleSettings::default(),
            golden_quote: GoldenQuoteSettings::default(),
            dialogue_poll: DialoguePollSettings::default(),
            personal_report: PersonalReportSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HistoryFilterSettings {
    /// Messages starting with any of these prefixes are dropped (commands,
    /// bot invocations and the like).
    pub prefixes: Vec<String>,
    pub excluded_users: Vec<String>,
    pub skip_bots: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    pub enabled: bool,
    pub provider_id: Option<String>,
    pub max_tokens: u32,
    pub max_topics: usize,
    pub prompt: Option<String>,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider_id: None,
            max_tokens: 12288,
            max_topics: 5,
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserTitleSettings {
    pub enabled: bool,
    pub provider_id: Option<String>,
    pub max_tokens: u32,
    pub max_titles: usize,
    pub prompt: Option<String>,
}

impl Default for UserTitleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider_id: None,
            max_tokens: 4096,
            max_titles: 8,
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoldenQuoteSettings {
    pub enabled: bool,
    pub provider_id: Option<String>,
    pub max_tokens: u32,
    pub max_quotes: usize,
    pub prompt: Option<String>,
}

impl Default for GoldenQuoteSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider_id: None,
            max_tokens: 4096,
            max_quotes: 5,
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialoguePollSettings {
    pub enabled: bool,
    pub provider_id: Option<String>,
    pub max_tokens: u32,
    pub max_options: usize,
    pub prompt: Option<String>,
}

impl Default for DialoguePollSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider_id: None,
            max_tokens: 400,
            max_options: 5,
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersonalReportSettings {
    pub enabled: bool,
    pub provider_id: Option<String>,
    pub max_tokens: u32,
    /// Cap on how many of the member's messages feed the profile.
    pub max_messages: usize,
    pub prompt: Option<String>,
}

impl Default for PersonalReportSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider_id: None,
            max_tokens: 2048,
            max_messages: 200,
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Default provider for all kinds without a per-kind override.
    pub provider_id: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff: BackoffSettings,
    pub providers: HashMap<String, ProviderSettings>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider_id: "default".to_string(),
            timeout_secs: 30,
            retries: 2,
            backoff: BackoffSettings::default(),
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffSettings {
    Fixed {
        delay_secs: u64,
    },
    Exponential {
        base_secs: u64,
        multiplier: f64,
        cap_secs: u64,
    },
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings::Exponential {
            base_secs: 2,
            multiplier: 2.0,
            cap_secs: 30,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            model: "local-model".to_string(),
            api_key_env: None,
        }
    }
}

impl ProviderSettings {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_ref().and_then(|name| env::var(name).ok())
    }
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key_env", &self.api_key_env)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// "image", "text" or "pdf".
    pub format: String,
    pub template: String,
    pub template_dir: Option<PathBuf>,
    pub pdf: PdfSettings,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: "image".to_string(),
            template: "scrapbook".to_string(),
            template_dir: None,
            pdf: PdfSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PdfSettings {
    pub filename_format: String,
    pub browser_path: Option<PathBuf>,
}

impl Default for PdfSettings {
    fn default() -> Self {
        Self {
            filename_format: "room_report_{room_id}_{date}.pdf".to_string(),
            browser_path: None,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Config-file path, overridable for deployments with a shared data dir.
    pub fn default_path() -> PathBuf {
        env::var("ROOMDIGEST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("roomdigest.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.group_access.mode.as_str(),
            "whitelist" | "blacklist" | "none"
        ) {
            return Err(ConfigError::invalid(
                "group_access.mode",
                format!(
                    "{:?} (expected whitelist, blacklist or none)",
                    self.group_access.mode
                ),
            ));
        }
        if crate::model::OutputFormat::parse(&self.output.format).is_none() {
            return Err(ConfigError::invalid(
                "output.format",
                format!("{:?} (expected image, text or pdf)", self.output.format),
            ));
        }
        if parse_wall_clock(&self.auto_analysis.time).is_none() {
            return Err(ConfigError::invalid(
                "auto_analysis.time",
                format!("{:?} (expected HH:MM)", self.auto_analysis.time),
            ));
        }
        if self.analysis.max_concurrent_tasks == 0 {
            return Err(ConfigError::invalid(
                "analysis.max_concurrent_tasks",
                "must be at least 1",
            ));
        }
        if let BackoffSettings::Exponential { multiplier, .. } = self.llm.backoff {
            if multiplier < 1.0 {
                return Err(ConfigError::invalid(
                    "llm.backoff.multiplier",
                    "must be >= 1.0",
                ));
            }
        }
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }
}

pub fn parse_wall_clock(s: &str) -> Option<chrono::NaiveTime> {
    chrono::NaiveTime::parse_from_str(s, "%H:%M").ok()
}
