use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub source: StorageSettings,
    pub output: StorageSettings,
    #[serde(default)]
    pub s3: S3Settings,
    #[serde(default)]
    pub layout: SourceLayout,
    #[serde(default)]
    pub transform: TransformSettings,
    #[serde(default)]
    pub load: LoadSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub quality: QualitySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
}

/// Where a dataset lives: a directory for `local`, a bucket for `s3`.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub kind: StorageKind,
    pub location: String,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Settings {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_s3_region")]
    pub region: String,
    // Both keys must be present to use static credentials
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceLayout {
    #[serde(default = "default_song_pattern")]
    pub song_pattern: String,
    #[serde(default = "default_log_pattern")]
    pub log_pattern: String,
}

/// How a play event is matched against the song catalog.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinPredicate {
    Title,
    #[default]
    TitleArtist,
    TitleArtistDuration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransformSettings {
    #[serde(default)]
    pub join: JoinPredicate,
    #[serde(default = "default_duration_tolerance")]
    pub duration_tolerance: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    #[default]
    Overwrite,
    Append,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoadSettings {
    #[serde(default)]
    pub dimension_mode: LoadMode,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualitySettings {
    #[serde(default = "default_true")]
    pub require_non_empty: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_s3_region(),
            access_key: None,
            secret_key: None,
            allow_http: false,
        }
    }
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            song_pattern: default_song_pattern(),
            log_pattern: default_log_pattern(),
        }
    }
}

impl TransformSettings {
    pub fn validate(&self) -> crate::Result<()> {
        validate_duration_tolerance(self.duration_tolerance)
    }
}

/// Rejects tolerances no event could ever match within.
pub fn validate_duration_tolerance(tolerance: f64) -> crate::Result<()> {
    if !tolerance.is_finite() || tolerance < 0.0 {
        return Err(crate::Error::InvalidInput(format!(
            "Duration tolerance must be a non-negative number, got {}",
            tolerance
        )));
    }
    Ok(())
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            join: JoinPredicate::default(),
            duration_tolerance: default_duration_tolerance(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            require_non_empty: true,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_s3_region() -> String {
    "us-west-2".to_string()
}

fn default_song_pattern() -> String {
    "song_data/*/*/*/*.json".to_string()
}

fn default_log_pattern() -> String {
    "log_data/*/*/*.json".to_string()
}

fn default_duration_tolerance() -> f64 {
    1e-3
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::with_name(path));
        Self::build(builder)
    }

    /// Parses settings from an in-memory TOML document.
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::from_str(document, FileFormat::Toml));
        Self::build(builder)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config = builder
            .add_source(
                Environment::with_prefix("SPARKIFY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings
            .transform
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        debug!(
            source = %settings.source.location,
            output = %settings.output.location,
            join = ?settings.transform.join,
            "Parsed settings"
        );

        Ok(settings)
    }
}
