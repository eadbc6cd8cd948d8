mod settings;

pub use settings::{ErrorReporting, Settings, CONFIG_PATH_VAR};
