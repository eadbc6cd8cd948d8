use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use config::{Config, ConfigError, Environment, File};

use crate::{logging::LoggingConfig, reporter::ErrorReportMode, store::StoreAddress, topics};

/// Переменная с путём к необязательному файлу конфигурации.
pub const CONFIG_PATH_VAR: &str = "GILMOUR_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorReporting {
    #[default]
    Disabled,
    Broadcast,
    Buffered,
}

/// Настройки бэкенда. У каждого поля есть значение по умолчанию, поэтому
/// достаточно частичного файла или пары переменных окружения.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub db: usize,
    pub health_check: bool,
    pub error_reporting: ErrorReporting,
    pub error_queue: String,
    pub error_buffer_len: usize,
    /// Передаётся клиентам; сам бэкенд stdout не перенаправляет.
    pub capture_stdout: bool,
    pub worker_threads: usize,
    pub startup_timeout_ms: u64,
    pub default_timeout_secs: u64,
    pub lock_expiry_secs: u64,
    pub unregister_attempts: u32,
    pub unregister_backoff_ms: u64,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            health_check: false,
            error_reporting: ErrorReporting::Disabled,
            error_queue: topics::ERROR_QUEUE.to_string(),
            error_buffer_len: 9999,
            capture_stdout: false,
            worker_threads: 4,
            startup_timeout_ms: 5000,
            default_timeout_secs: 600,
            lock_expiry_secs: 600,
            unregister_attempts: 5,
            unregister_backoff_ms: 100,
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Значения по умолчанию, затем файл из `GILMOUR_CONFIG` (если задан),
    /// затем переменные `GILMOUR_*` (`__` разделяет вложенные ключи,
    /// например `GILMOUR_LOGGING__LEVEL`).
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            builder = builder.add_source(File::with_name(&path).required(true));
        }
        let settings: Self = builder
            .add_source(
                Environment::with_prefix("GILMOUR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Загружает один файл (формат по расширению).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings: Self = Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Message("worker_threads must be at least 1".into()));
        }
        if self.error_buffer_len == 0 {
            return Err(ConfigError::Message("error_buffer_len must be at least 1".into()));
        }
        if self.error_reporting == ErrorReporting::Buffered && self.error_queue.is_empty() {
            return Err(ConfigError::Message(
                "error_queue must be set for buffered error reporting".into(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> StoreAddress {
        StoreAddress {
            host: self.host.clone(),
            port: self.port,
            db: self.db,
        }
    }

    pub fn error_report_mode(&self) -> ErrorReportMode {
        match self.error_reporting {
            ErrorReporting::Disabled => ErrorReportMode::Disabled,
            ErrorReporting::Broadcast => ErrorReportMode::Broadcast,
            ErrorReporting::Buffered => ErrorReportMode::Buffered {
                queue: self.error_queue.clone(),
            },
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn lock_expiry(&self) -> Duration {
        Duration::from_secs(self.lock_expiry_secs)
    }

    pub fn unregister_backoff(&self) -> Duration {
        Duration::from_millis(self.unregister_backoff_ms)
    }
}
