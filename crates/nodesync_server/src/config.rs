use nodesync_core::config::EngineConfig;
use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Directory holding one database per workspace (default: ./data)
    pub data_dir: PathBuf,
    /// Engine tuning, from the TOML file named by ENGINE_CONFIG
    pub engine: EngineConfig,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let data_dir =
            PathBuf::from(env::var("DATABASE_PATH").unwrap_or_else(|_| "./data".to_string()));

        let engine = match env::var("ENGINE_CONFIG") {
            Ok(path) => EngineConfig::load_from(&PathBuf::from(path))
                .map_err(|e| ConfigError::InvalidEngineConfig(e.to_string()))?,
            Err(_) => EngineConfig::default(),
        };

        let cors_origins = parse_origins(
            &env::var("CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:5174".to_string()),
        );

        Ok(Config {
            host,
            port,
            data_dir,
            engine,
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidEngineConfig(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidEngineConfig(e) => write!(f, "Invalid ENGINE_CONFIG file: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
