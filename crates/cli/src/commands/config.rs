//! Config command - view or modify configuration.

use anyhow::{bail, Result};
use chatsnap_core::config::ProbeConfig;
use chatsnap_core::Config;

pub async fn execute(key: Option<String>, value: Option<String>) -> Result<()> {
    let mut config = Config::load_with_env()?;

    match (key.as_deref(), value) {
        (None, None) => {
            println!("Current Configuration");
            println!("=====================");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        (Some(key), None) => match key {
            "display_name" => println!("{}", config.display_name),
            "assistant_name" => println!("{}", config.assistant_name),
            "user_id" => println!("{:?}", config.user_id),
            "data_dir" => println!("{:?}", config.data_dir),
            "debounce_ms" => println!("{}", config.debounce_ms),
            "probe" => println!("{:?}", config.probe.as_ref().map(|p| &p.address)),
            _ => println!("Unknown config key: {}", key),
        },
        (Some(key), Some(value)) => {
            match key {
                "display_name" => config.display_name = value,
                "assistant_name" => config.assistant_name = value,
                "data_dir" => {
                    config.data_dir = if value.is_empty() {
                        None
                    } else {
                        Some(value.into())
                    };
                }
                "debounce_ms" => config.debounce_ms = value.parse()?,
                "probe" => {
                    config.probe = if value.is_empty() {
                        None
                    } else {
                        Some(ProbeConfig::new(value))
                    };
                }
                _ => bail!("Cannot set config key: {}", key),
            }
            config.validate()?;
            config.save()?;
            println!("Set {}", key);
        }
        (None, Some(_)) => {
            println!("Must specify a key to set a value");
        }
    }

    Ok(())
}
