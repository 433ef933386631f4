use quant_engine_core::EngineConfig;
use tracing::debug;

use super::file;

/// Engine settings from `--config`, falling back to defaults.
pub fn load_config(path: Option<&str>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(p) => {
            let config: EngineConfig = file::read_document(p)?;
            debug!(path = p, "loaded engine config");
            config
        }
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}
