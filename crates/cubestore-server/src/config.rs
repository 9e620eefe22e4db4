use cubestore_world::StorageConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub world: WorldSection,
    #[serde(default)]
    pub storage: StorageConfig,
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct WorldSection {
    /// World directory holding `regions/`.
    pub directory: String,
    /// Grass layer height of the flat generator.
    #[serde(default = "default_surface_height")]
    pub surface_height: i32,
    /// Radius in chunks of the area kept loaded around spawn.
    #[serde(default = "default_spawn_radius")]
    pub spawn_radius: i32,
}

fn default_surface_height() -> i32 {
    64
}

fn default_spawn_radius() -> i32 {
    2
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    pub level: String,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}
