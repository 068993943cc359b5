//! Application settings loaded from the environment.
//!
//! Every knob has a documented default so the engine runs without any
//! configuration. Paths under the datasets root are derived here so the
//! rest of the crate never builds dataset paths by hand.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all dataset directories.
    pub datasets_path: PathBuf,

    /// Upload size limit in MiB.
    pub max_file_size_mb: u64,

    /// Thresholds used when a request does not supply any.
    pub default_thresholds: Vec<i64>,

    /// Accepted upload extensions, lowercase with dot.
    pub allowed_extensions: Vec<String>,

    /// When set, callers must present a matching X-API-Key.
    pub api_key: Option<String>,

    /// Origins allowed by the outer HTTP layer.
    pub allowed_origins: Vec<String>,

    /// Master switch for the advisory layer.
    pub use_llm: bool,

    /// Advisory provider: "openai" or "anthropic".
    pub llm_provider: String,

    /// Model override; provider default when absent.
    pub llm_model: Option<String>,

    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,

    /// Per-call provider timeout.
    pub llm_timeout_secs: u64,

    /// Maximum advisory calls per dataset.
    pub llm_call_budget: usize,

    pub rate_limit_per_minute: usize,

    /// Entity count above which a performance warning is emitted.
    pub large_dataset_threshold: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            datasets_path: PathBuf::from("storage/datasets"),
            max_file_size_mb: 25,
            default_thresholds: vec![10, 20, 50],
            allowed_extensions: vec![".xlsx".into(), ".xls".into(), ".csv".into()],
            api_key: None,
            allowed_origins: vec![
                "http://localhost:3000".into(),
                "http://localhost:5173".into(),
                "http://localhost:8000".into(),
            ],
            use_llm: true,
            llm_provider: "openai".into(),
            llm_model: None,
            openai_api_key: None,
            anthropic_api_key: None,
            llm_timeout_secs: 30,
            llm_call_budget: 10,
            rate_limit_per_minute: 60,
            large_dataset_threshold: 10_000,
        }
    }
}

impl Settings {
    /// Build settings from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Settings::default();

        Self {
            datasets_path: std::env::var("DATASETS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.datasets_path),
            max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", defaults.max_file_size_mb),
            default_thresholds: std::env::var("DEFAULT_THRESHOLDS")
                .ok()
                .and_then(|raw| parse_int_list(&raw))
                .unwrap_or(defaults.default_thresholds),
            allowed_extensions: defaults.allowed_extensions,
            api_key: env_opt("API_KEY"),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.allowed_origins),
            use_llm: std::env::var("USE_LLM")
                .ok()
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.use_llm),
            llm_provider: std::env::var("LLM_PROVIDER").unwrap_or(defaults.llm_provider),
            llm_model: env_opt("LLM_MODEL"),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            llm_timeout_secs: env_parse("LLM_TIMEOUT_SECS", defaults.llm_timeout_secs),
            llm_call_budget: env_parse("LLM_CALL_BUDGET", defaults.llm_call_budget),
            rate_limit_per_minute: env_parse(
                "RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            ),
            large_dataset_threshold: env_parse(
                "LARGE_DATASET_THRESHOLD",
                defaults.large_dataset_threshold,
            ),
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn dataset_path(&self, dataset_id: &str) -> PathBuf {
        self.datasets_path.join(dataset_id)
    }

    pub fn normalized_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_path(dataset_id).join("normalized.parquet")
    }

    pub fn schema_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_path(dataset_id).join("schema.json")
    }

    pub fn lineage_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_path(dataset_id).join("lineage.json")
    }

    pub fn analyses_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_path(dataset_id).join("analyses")
    }

    pub fn llm_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_path(dataset_id).join("llm")
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_int_list(raw: &str) -> Option<Vec<i64>> {
    let parsed: Vec<i64> = raw
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.default_thresholds, vec![10, 20, 50]);
        assert_eq!(settings.max_file_size_bytes(), 25 * 1024 * 1024);
        assert!(settings.allowed_extensions.contains(&".csv".to_string()));
    }

    #[test]
    fn parses_threshold_list() {
        assert_eq!(parse_int_list("5, 25 ,75"), Some(vec![5, 25, 75]));
        assert_eq!(parse_int_list(""), None);
    }
}
