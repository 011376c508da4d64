use std::path::Path;

use crate::error::{ComputeError, Result};
use crate::models::ComputeConfiguration;

pub const CONFIG_FILENAME: &str = "compute.yaml";

pub fn load(config_path: &Path) -> Result<ComputeConfiguration> {
    if !config_path.exists() {
        return Err(ComputeError::ConfigNotFound(config_path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(config_path)?;
    parse(&contents)
}

pub fn parse(contents: &str) -> Result<ComputeConfiguration> {
    let config: ComputeConfiguration = serde_yaml::from_str(contents)
        .map_err(|e| ComputeError::InvalidConfig(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ComputeConfiguration) -> Result<()> {
    if config.package_folder.as_os_str().is_empty() {
        return Err(ComputeError::InvalidConfig(
            "package_folder field is required".into(),
        ));
    }
    if config.staging_root.as_os_str().is_empty() {
        return Err(ComputeError::InvalidConfig(
            "staging_root field is required".into(),
        ));
    }
    if config.instance_count == 0 {
        return Err(ComputeError::InvalidConfig(
            "instance_count must be positive".into(),
        ));
    }
    if config.port_range.start > config.port_range.end {
        return Err(ComputeError::InvalidConfig(format!(
            "port_range start {} is greater than end {}",
            config.port_range.start, config.port_range.end
        )));
    }
    if config.port_range.len() < config.instance_count {
        return Err(ComputeError::InvalidConfig(format!(
            "port_range holds {} ports but instance_count is {}",
            config.port_range.len(),
            config.instance_count
        )));
    }
    if config.polling_interval_ms == 0 || config.health_check_interval_ms == 0 {
        return Err(ComputeError::InvalidConfig(
            "polling and health check intervals must be positive".into(),
        ));
    }
    if let Some(command) = &config.container_command {
        if command.is_empty() {
            return Err(ComputeError::InvalidConfig(
                "container_command must name a program".into(),
            ));
        }
    }
    Ok(())
}
