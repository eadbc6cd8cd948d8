pub mod config;
pub mod filters;

pub use self::config::{LogFormat, LoggingConfig};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),
    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Инициализация логирования с конфигурацией.
///
/// Повторный вызов возвращает [`LoggingError::Init`], а не паникует.
pub fn init_logging(mut config: LoggingConfig) -> Result<(), LoggingError> {
    config.apply_env_overrides();
    config.validate()?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filters::build_filter_from_config(&config))
        .with_ansi(config.with_ansi)
        .with_target(config.with_target)
        .with_thread_names(true);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| LoggingError::Init(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        format = ?config.format,
        "Logging system initialized"
    );
    Ok(())
}
