//! Settings Persistence System
//!
//! Provides persistent engine settings with:
//! - Atomic file writes (temp file + rename)
//! - Tolerant loading with defaults
//! - Normalization of out-of-range values
//!
//! Storage location: {data_dir}/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::core::acquisition::{SchedulerConfig, SurplusPolicy};
use crate::core::models::{ComputeType, ModelKind};
use crate::core::{CoreError, CoreResult, DevicePreference};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// Model cache settings
    #[serde(default)]
    pub models: ModelSettings,

    /// Clip acquisition settings
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            models: ModelSettings::default(),
            acquisition: AcquisitionSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Normalizes and clamps settings so persisted state is always valid.
    ///
    /// Corrects bad values instead of failing, so an old or hand-edited
    /// file never stops the engine from starting.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;
        self.models.normalize();
        self.acquisition.normalize();
    }
}

fn normalize_enum(value: &str, allowed: &[&str], fallback: String) -> String {
    if allowed.iter().any(|v| v.eq_ignore_ascii_case(value.trim())) {
        value.trim().to_ascii_lowercase()
    } else {
        fallback
    }
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Model Settings
// =============================================================================

/// Model cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelSettings {
    /// Device preference ("auto", "cuda", "cpu")
    #[serde(default = "default_device")]
    pub device: String,

    /// Whisper model name
    #[serde(default = "default_whisper_model")]
    pub whisper_model: String,

    /// Whisper compute type override ("float16", "float32", "int8")
    #[serde(default)]
    pub whisper_compute_type: Option<String>,

    /// Sentence transformer model name
    #[serde(default = "default_sentence_transformer_model")]
    pub sentence_transformer_model: String,

    /// CLIP model name
    #[serde(default = "default_clip_model")]
    pub clip_model: String,

    /// Directory holding local model files
    #[serde(default)]
    pub models_dir: Option<String>,

    /// Models loaded at startup
    #[serde(default = "default_preload")]
    pub preload: Vec<String>,

    /// Load startup models concurrently
    #[serde(default = "default_true")]
    pub parallel_preload: bool,
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_whisper_model() -> String {
    ModelKind::Whisper.default_key().to_string()
}

fn default_sentence_transformer_model() -> String {
    ModelKind::SentenceTransformer.default_key().to_string()
}

fn default_clip_model() -> String {
    ModelKind::Clip.default_key().to_string()
}

fn default_preload() -> Vec<String> {
    vec![
        ModelKind::SentenceTransformer.name().to_string(),
        ModelKind::Clip.name().to_string(),
    ]
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            device: default_device(),
            whisper_model: default_whisper_model(),
            whisper_compute_type: None,
            sentence_transformer_model: default_sentence_transformer_model(),
            clip_model: default_clip_model(),
            models_dir: None,
            preload: default_preload(),
            parallel_preload: true,
        }
    }
}

impl ModelSettings {
    fn normalize(&mut self) {
        self.device = normalize_enum(&self.device, &["auto", "cuda", "cpu"], default_device());

        self.whisper_compute_type = self.whisper_compute_type.as_deref().and_then(|value| {
            let normalized = normalize_enum(value, &["float16", "float32", "int8"], String::new());
            if normalized.is_empty() {
                warn!("Unknown whisper compute type '{}', using device default", value);
                None
            } else {
                Some(normalized)
            }
        });

        for (name, fallback) in [
            (&mut self.whisper_model, default_whisper_model()),
            (&mut self.sentence_transformer_model, default_sentence_transformer_model()),
            (&mut self.clip_model, default_clip_model()),
        ] {
            if name.trim().is_empty() {
                *name = fallback;
            }
        }

        let mut preload: Vec<String> = Vec::with_capacity(self.preload.len());
        for name in &self.preload {
            match name.parse::<ModelKind>() {
                Ok(kind) if !preload.iter().any(|n| n == kind.name()) => {
                    preload.push(kind.name().to_string())
                }
                Ok(_) => {}
                Err(_) => warn!("Dropping unknown preload model '{}'", name),
            }
        }
        self.preload = preload;
    }

    /// Parsed device preference
    pub fn device_preference(&self) -> DevicePreference {
        DevicePreference::parse_lenient(&self.device)
    }

    /// Parsed compute type override
    pub fn compute_type_override(&self) -> Option<ComputeType> {
        match self.whisper_compute_type.as_deref() {
            Some("float16") => Some(ComputeType::Float16),
            Some("float32") => Some(ComputeType::Float32),
            Some("int8") => Some(ComputeType::Int8),
            _ => None,
        }
    }

    /// Configured construction key for a model
    pub fn key_for(&self, kind: ModelKind) -> &str {
        match kind {
            ModelKind::Whisper => &self.whisper_model,
            ModelKind::SentenceTransformer => &self.sentence_transformer_model,
            ModelKind::Clip => &self.clip_model,
            ModelKind::Chatterbox => kind.default_key(),
        }
    }
}

// =============================================================================
// Acquisition Settings
// =============================================================================

/// Clip acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionSettings {
    /// Use parallel acquisition (sequential when false)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum concurrent downloads
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-download timeout in seconds
    #[serde(default = "default_per_task_timeout_secs")]
    pub per_task_timeout_secs: u64,

    /// Maximum seconds each clip contributes
    #[serde(default = "default_max_clip_duration_secs")]
    pub max_clip_duration_secs: u32,

    /// Handling of downloads finished after the target was met ("keep", "cleanup")
    #[serde(default = "default_surplus_policy")]
    pub surplus_policy: String,
}

fn default_max_workers() -> usize {
    5
}

fn default_per_task_timeout_secs() -> u64 {
    120
}

fn default_max_clip_duration_secs() -> u32 {
    5
}

fn default_surplus_policy() -> String {
    "keep".to_string()
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: default_max_workers(),
            per_task_timeout_secs: default_per_task_timeout_secs(),
            max_clip_duration_secs: default_max_clip_duration_secs(),
            surplus_policy: default_surplus_policy(),
        }
    }
}

impl AcquisitionSettings {
    fn normalize(&mut self) {
        self.max_workers = self.max_workers.clamp(1, 32);
        self.per_task_timeout_secs = self.per_task_timeout_secs.clamp(1, 3600);
        self.max_clip_duration_secs = self.max_clip_duration_secs.clamp(1, 600);
        self.surplus_policy = normalize_enum(
            &self.surplus_policy,
            &["keep", "cleanup"],
            default_surplus_policy(),
        );
    }

    pub fn surplus_policy(&self) -> SurplusPolicy {
        if self.surplus_policy == "cleanup" {
            SurplusPolicy::Cleanup
        } else {
            SurplusPolicy::Keep
        }
    }

    /// Scheduler configuration. Disabled parallelism runs one task at a time.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: if self.enabled { self.max_workers } else { 1 },
            per_task_timeout: Duration::from_secs(self.per_task_timeout_secs),
            surplus_policy: self.surplus_policy(),
        }
    }
}

// =============================================================================
// Settings Manager
// =============================================================================

/// Loads and saves settings under a data directory
#[derive(Debug, Clone)]
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager with the given data directory
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            settings_path: data_dir.join(SETTINGS_FILE),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CoreError::Settings(format!("Failed to create settings directory: {}", e))
            })?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())
            .map_err(|e| CoreError::Settings(format!("Failed to open settings lock file: {}", e)))?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)
                .map_err(|e| CoreError::Settings(format!("Failed to lock settings file: {}", e)))?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)
                .map_err(|e| CoreError::Settings(format!("Failed to lock settings file: {}", e)))?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> &PathBuf {
        &self.settings_path
    }

    /// Load settings from disk, returning defaults if missing or unreadable
    pub fn load(&self) -> EngineSettings {
        let result = self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(EngineSettings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let mut settings = serde_json::from_str::<EngineSettings>(&content)?;

            if settings.version < SETTINGS_VERSION {
                info!(
                    "Migrating settings from version {} to {}",
                    settings.version, SETTINGS_VERSION
                );
            }

            settings.normalize();
            Ok(settings)
        });

        match result {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                EngineSettings::default()
            }
        }
    }

    /// Save settings to disk using atomic write (temp file + rename)
    pub fn save(&self, settings: &EngineSettings) -> CoreResult<EngineSettings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();

            let content = serde_json::to_string_pretty(&normalized)?;

            let temp_path = self.settings_path.with_extension("json.tmp");
            if temp_path.exists() {
                let _ = fs::remove_file(&temp_path);
            }

            let mut file = fs::File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            drop(file);

            if cfg!(windows) && self.settings_path.exists() {
                // rename does not overwrite on Windows
                fs::remove_file(&self.settings_path)?;
            }
            fs::rename(&temp_path, &self.settings_path).map_err(|e| {
                CoreError::Settings(format!("Failed to finalize settings file: {}", e))
            })?;

            info!("Settings saved to {:?}", self.settings_path);
            Ok(normalized)
        })
    }

    /// Reset settings to defaults and delete the settings file
    pub fn reset(&self) -> CoreResult<EngineSettings> {
        self.with_lock(true, || {
            if self.settings_path.exists() {
                fs::remove_file(&self.settings_path)?;
                info!("Settings file deleted");
            }
            Ok(EngineSettings::default())
        })
    }
}
