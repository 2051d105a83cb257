mod settings;

use std::path::Path;

use config::{Config, Environment, File};

use crate::utils::error::SettingsError;

pub use settings::{
    BrokerServerSettings, BrokerSettings, DeadLetterPolicy, PartialSettings, Settings,
    TransportSettings,
};

/// Loads the configuration from `config/default`, then from `path` if given,
/// then from `TEXTROUTE_*` environment variables (nested keys separated by
/// `__`), and merges it with default values.
pub fn load_config(path: Option<&Path>) -> Result<Settings, SettingsError> {
    let mut builder =
        Config::builder().add_source(File::with_name("config/default").required(false));
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }
    builder = builder.add_source(
        Environment::with_prefix("TEXTROUTE")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("message_processors")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    let default = Settings {
        source: path.map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf())),
        ..Settings::default()
    };
    Ok(partial.merge(default))
}
