pub mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, DeadLetterSettings, ListenerSettings, PipelineSettings, PublisherSettings,
    Settings, StoreSettings, SummarizerSettings,
};

/// Loads the configuration from `config/default` and environment variables.
///
/// Environment variables use the `CRISPY` prefix and `__` between nested
/// keys, e.g. `CRISPY_BROKER__HOST` or `CRISPY_PIPELINE__BATCH_SIZE`.
/// Missing values fall back to the defaults of [`Settings`].
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit, optional config file.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix("CRISPY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("pipeline.required_fields"),
        );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests;
