use anyhow::{Result, anyhow};
use config::{Config, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub log: Log,
    pub store: Store,
    pub presence: Presence,
    pub receipts: Receipts,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub filter: String,
}

#[derive(Debug, Deserialize)]
pub struct Store {
    pub backend: String, // "memory"
}

#[derive(Debug, Deserialize)]
pub struct Presence {
    pub backend: String, // "memory"
    pub status_root: String,
}

#[derive(Debug, Deserialize)]
pub struct Receipts {
    /// Extra attempts for a conditional `seenStatus`/`seenBy` write that lost a race.
    pub max_conflict_retries: u32,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    pub shutdown_timeout_secs: u64,
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(SETTINGS_PATH);

    let settings: Settings = Config::builder()
        .add_source(File::with_name(path))
        .build()
        .map_err(|e| anyhow!(e))?
        .try_deserialize()
        .map_err(|e| anyhow!(e))?;

    Ok(settings)
}
