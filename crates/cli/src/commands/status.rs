//! Status command - shows paths and what is cached locally.

use anyhow::Result;
use chatsnap_core::chat::{LocalCache, SledCache};
use chatsnap_core::{platform, Config};

pub async fn execute() -> Result<()> {
    let config = Config::load_with_env()?;

    println!("Chatsnap Status");
    println!("===============");
    println!();

    println!("Identity:");
    println!("  Name:      {}", config.display_name);
    match &config.user_id {
        Some(id) => println!("  User id:   {}", id),
        None => println!("  User id:   (assigned on first run)"),
    }
    match &config.probe {
        Some(probe) => println!("  Probe:     {}", probe.address),
        None => println!("  Probe:     none (connectivity set manually)"),
    }

    println!();

    println!("Paths:");
    println!("  Config:    {:?}", platform::config_dir());
    println!("  Cache:     {:?}", config.cache_dir());

    println!();

    let config_file = platform::config_file_path();
    if config_file.exists() {
        println!("Config file: {:?}", config_file);
    } else {
        println!("Config file: Not found (using defaults)");
    }

    let cache_path = config.cache_dir();
    if !cache_path.exists() {
        println!("Cache:       Empty (never connected)");
        return Ok(());
    }

    match SledCache::open(&cache_path) {
        Ok(cache) => {
            let messages = cache.load().map(|s| s.len()).unwrap_or(0);
            println!("Cache:       {} message(s), {} queued", messages, cache.outbox_len());
        }
        Err(e) => {
            // sled holds an exclusive lock while a session is running.
            println!("Cache:       Unavailable ({})", e);
        }
    }

    Ok(())
}
