//! Loads [`Settings`] from `config/jobhub.{toml,yaml,json}` and `JOBHUB_*` environment variables.
//!
//! Nested keys are separated by a double underscore, so `JOBHUB_TASKS__ECHO__MAX_RETRIES=5` sets
//! `tasks.echo.max_retries`.
use config::{Config, ConfigError, Environment, File, Source};
use jobhub::settings::Settings;

pub const CONFIG_FILE: &str = "config/jobhub";
pub const ENV_PREFIX: &str = "JOBHUB";

pub fn load() -> Result<Settings, ConfigError> {
    load_from(File::with_name(CONFIG_FILE).required(false), environment())
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Environment values override the file.
fn load_from(
    file: impl Source + Send + Sync + 'static,
    environment: Environment,
) -> Result<Settings, ConfigError> {
    Config::builder()
        .add_source(file)
        .add_source(environment)
        .build()?
        .try_deserialize()
}
