use crate::queue::DEFAULT_MAX_CONCURRENT;
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4242;
pub const DEFAULT_DB_FILE: &str = "ralph.sqlite";
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Startup configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub max_concurrent: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("RALPH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            host: std::env::var("RALPH_HOST").unwrap_or(defaults.host),
            port: std::env::var("RALPH_PORT")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.port),
            max_concurrent: std::env::var("RALPH_MAX_CONCURRENT")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.max_concurrent),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::ServerConfig;

    #[test]
    fn defaults_match_the_documented_knobs() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:4242");
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.db_path.to_str(), Some("ralph.sqlite"));
    }
}
