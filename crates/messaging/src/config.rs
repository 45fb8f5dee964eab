use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use homelink_storage::{SqliteStorage, StorageResult};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::live_channel::Backoff;

pub const SETTINGS_DIRECTORY_NAME: &str = "homelink";
pub const SETTINGS_FILE_NAME: &str = "messaging.json";
pub const DATABASE_FILE_NAME: &str = "messaging.db";
pub const ENV_PREFIX: &str = "HOMELINK_";

pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_BACKOFF_CEILING_MS: u64 = 30_000;
pub const DEFAULT_UNAVAILABLE_AFTER_ATTEMPTS: u32 = 5;
pub const DEFAULT_PREVIEW_MAX_CHARS: usize = 80;
pub const DEFAULT_FEED_CAPACITY: usize = homelink_storage::DEFAULT_FEED_CAPACITY;

/// Tunables for the messaging core. Every field has a default so partial files are valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_ceiling_ms: u64,
    /// Consecutive failed connects before the channel reports itself unavailable.
    pub unavailable_after_attempts: u32,
    pub preview_max_chars: usize,
    pub feed_capacity: usize,
    pub database_path: Option<PathBuf>,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            backoff_ceiling_ms: DEFAULT_BACKOFF_CEILING_MS,
            unavailable_after_attempts: DEFAULT_UNAVAILABLE_AFTER_ATTEMPTS,
            preview_max_chars: DEFAULT_PREVIEW_MAX_CHARS,
            feed_capacity: DEFAULT_FEED_CAPACITY,
            database_path: None,
        }
    }
}

impl MessagingSettings {
    /// Replaces out-of-range values with defaults instead of rejecting the whole file.
    pub fn normalized(mut self) -> Self {
        if self.backoff_initial_ms == 0 {
            self.backoff_initial_ms = DEFAULT_BACKOFF_INITIAL_MS;
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            self.backoff_multiplier = DEFAULT_BACKOFF_MULTIPLIER;
        }
        if self.backoff_ceiling_ms < self.backoff_initial_ms {
            self.backoff_ceiling_ms = self.backoff_initial_ms;
        }
        if self.unavailable_after_attempts == 0 {
            self.unavailable_after_attempts = 1;
        }
        if self.preview_max_chars == 0 {
            self.preview_max_chars = DEFAULT_PREVIEW_MAX_CHARS;
        }
        if self.feed_capacity == 0 {
            self.feed_capacity = DEFAULT_FEED_CAPACITY;
        }
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.backoff_ceiling_ms),
        )
    }

    pub fn database_location(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| SettingsStore::default_config_dir().join(DATABASE_FILE_NAME))
    }

    /// Opens SQLite storage at [`Self::database_location`] with this feed capacity.
    pub async fn open_storage(&self) -> StorageResult<SqliteStorage> {
        let location = self.database_location();
        SqliteStorage::open_with_feed_capacity(&location.to_string_lossy(), self.feed_capacity)
            .await
    }

    /// Layers defaults, an optional JSON file, then `HOMELINK_*` environment variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Json::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, figment::Error> {
        figment.extract::<Self>().map(Self::normalized)
    }
}

/// Lock-free shared view of the current settings; readers see updates on their next load.
#[derive(Debug, Clone)]
pub struct SharedSettings(Arc<ArcSwap<MessagingSettings>>);

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(MessagingSettings::default())
    }
}

impl SharedSettings {
    pub fn new(settings: MessagingSettings) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(settings.normalized())))
    }

    pub fn current(&self) -> Arc<MessagingSettings> {
        self.0.load_full()
    }

    pub fn replace(&self, settings: MessagingSettings) {
        self.0.store(Arc::new(settings.normalized()));
    }
}

pub struct SettingsStore {
    settings: SharedSettings,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".homelink"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: SharedSettings::new(settings),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<MessagingSettings> {
        self.settings.current()
    }

    pub fn shared(&self) -> SharedSettings {
        self.settings.clone()
    }

    pub fn update(&self, settings: MessagingSettings) -> Result<(), ConfigError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.replace(normalized_settings);
        Ok(())
    }

    fn load_from_disk(path: &Path) -> MessagingSettings {
        let file = if path.exists() {
            Some(path)
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
            None
        };

        match MessagingSettings::from_figment(&MessagingSettings::figment(file)) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                MessagingSettings::default()
            }
        }
    }

    fn persist(&self, settings: &MessagingSettings) -> Result<(), ConfigError> {
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

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
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
