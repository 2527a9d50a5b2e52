//! Environment-backed configuration.
//!
//! Every setting has a default. Override with `CONDENSE_*` environment variables.

pub mod error;


pub use error::ConfigError;

use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use candle_core::DType;

use crate::constants::{DEFAULT_JUDGE_MAX_NEW_TOKENS, DEFAULT_MAX_NEW_TOKENS};
use crate::scoring::ScoringSettings;

/// Precision model weights are loaded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelDtype {
    #[default]
    Bf16,
    F16,
    F32,
}

impl ModelDtype {
    pub fn to_dtype(self) -> DType {
        match self {
            ModelDtype::Bf16 => DType::BF16,
            ModelDtype::F16 => DType::F16,
            ModelDtype::F32 => DType::F32,
        }
    }
}

impl FromStr for ModelDtype {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bf16" | "bfloat16" => Ok(ModelDtype::Bf16),
            "f16" | "fp16" | "float16" => Ok(ModelDtype::F16),
            "f32" | "fp32" | "float32" => Ok(ModelDtype::F32),
            _ => Err(ConfigError::InvalidDtype {
                value: s.to_string(),
            }),
        }
    }
}

/// Server configuration loaded from environment variables.
///
/// Use [`Config::from_env`] to read `CONDENSE_*` overrides on top of defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port. Default: `8080`.
    pub port: u16,

    /// IP address to bind to. Default: `0.0.0.0`.
    pub bind_addr: IpAddr,

    /// Local directory searched for `<identifier>/` model checkpoints before the hub.
    pub models_dir: Option<PathBuf>,

    /// Weight precision. Default: bf16.
    pub model_dtype: ModelDtype,

    /// Max models kept loaded (LRU). Default: unbounded.
    pub model_cache_capacity: Option<u64>,

    /// New-token budget for accuracy completions. Default: `64`.
    pub max_new_tokens: usize,

    /// New-token budget for judge verdicts. Default: `32`.
    pub judge_max_new_tokens: usize,

    /// Models loaded before the server starts accepting requests.
    pub preload_models: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            models_dir: None,
            model_dtype: ModelDtype::default(),
            model_cache_capacity: None,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            judge_max_new_tokens: DEFAULT_JUDGE_MAX_NEW_TOKENS,
            preload_models: Vec::new(),
        }
    }
}

impl Config {
    pub const ENV_PORT: &'static str = "CONDENSE_PORT";
    const ENV_BIND_ADDR: &'static str = "CONDENSE_BIND_ADDR";
    const ENV_MODELS_DIR: &'static str = "CONDENSE_MODELS_DIR";
    const ENV_MODEL_DTYPE: &'static str = "CONDENSE_MODEL_DTYPE";
    const ENV_MODEL_CACHE_CAPACITY: &'static str = "CONDENSE_MODEL_CACHE_CAPACITY";
    const ENV_MAX_NEW_TOKENS: &'static str = "CONDENSE_MAX_NEW_TOKENS";
    const ENV_JUDGE_MAX_NEW_TOKENS: &'static str = "CONDENSE_JUDGE_MAX_NEW_TOKENS";
    const ENV_PRELOAD_MODELS: &'static str = "CONDENSE_PRELOAD_MODELS";

    /// Loads configuration from environment variables (falling back to defaults).
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = Self::parse_port_from_env(defaults.port)?;
        let bind_addr = Self::parse_bind_addr_from_env(defaults.bind_addr)?;
        let models_dir = Self::parse_optional_path_from_env(Self::ENV_MODELS_DIR);
        let model_dtype = match Self::non_empty_var(Self::ENV_MODEL_DTYPE) {
            Some(value) => value.parse()?,
            None => defaults.model_dtype,
        };
        let model_cache_capacity = Self::non_empty_var(Self::ENV_MODEL_CACHE_CAPACITY)
            .map(|value| Self::parse_number(Self::ENV_MODEL_CACHE_CAPACITY, value))
            .transpose()?;
        let max_new_tokens =
            Self::parse_usize_from_env(Self::ENV_MAX_NEW_TOKENS, defaults.max_new_tokens)?;
        let judge_max_new_tokens = Self::parse_usize_from_env(
            Self::ENV_JUDGE_MAX_NEW_TOKENS,
            defaults.judge_max_new_tokens,
        )?;
        let preload_models = Self::non_empty_var(Self::ENV_PRELOAD_MODELS)
            .map(|value| parse_list(&value))
            .unwrap_or_default();

        Ok(Self {
            port,
            bind_addr,
            models_dir,
            model_dtype,
            model_cache_capacity,
            max_new_tokens,
            judge_max_new_tokens,
            preload_models,
        })
    }

    /// Validates paths and basic invariants (does not create directories).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.models_dir {
            if !path.exists() {
                return Err(ConfigError::PathNotFound { path: path.clone() });
            }
            if !path.is_dir() {
                return Err(ConfigError::NotADirectory { path: path.clone() });
            }
        }

        if self.model_cache_capacity == Some(0) {
            return Err(ConfigError::ZeroValue {
                name: Self::ENV_MODEL_CACHE_CAPACITY,
            });
        }
        if self.max_new_tokens == 0 {
            return Err(ConfigError::ZeroValue {
                name: Self::ENV_MAX_NEW_TOKENS,
            });
        }
        if self.judge_max_new_tokens == 0 {
            return Err(ConfigError::ZeroValue {
                name: Self::ENV_JUDGE_MAX_NEW_TOKENS,
            });
        }

        Ok(())
    }

    /// Returns `"{bind_addr}:{port}"` (useful for logging/binding).
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn scoring_settings(&self) -> ScoringSettings {
        ScoringSettings {
            max_new_tokens: self.max_new_tokens,
            judge_max_new_tokens: self.judge_max_new_tokens,
        }
    }

    fn parse_port_from_env(default: u16) -> Result<u16, ConfigError> {
        match env::var(Self::ENV_PORT) {
            Ok(value) => {
                let port: u16 = value.parse().map_err(|e| ConfigError::PortParseError {
                    value: value.clone(),
                    source: e,
                })?;

                if port == 0 {
                    return Err(ConfigError::InvalidPort { value });
                }

                Ok(port)
            }
            Err(_) => Ok(default),
        }
    }

    fn parse_bind_addr_from_env(default: IpAddr) -> Result<IpAddr, ConfigError> {
        match env::var(Self::ENV_BIND_ADDR) {
            Ok(value) => value
                .parse()
                .map_err(|e| ConfigError::InvalidBindAddr { value, source: e }),
            Err(_) => Ok(default),
        }
    }

    fn parse_optional_path_from_env(var_name: &str) -> Option<PathBuf> {
        Self::non_empty_var(var_name).map(PathBuf::from)
    }

    fn parse_usize_from_env(var_name: &'static str, default: usize) -> Result<usize, ConfigError> {
        match Self::non_empty_var(var_name) {
            Some(value) => Self::parse_number(var_name, value),
            None => Ok(default),
        }
    }

    fn parse_number<T>(name: &'static str, value: String) -> Result<T, ConfigError>
    where
        T: FromStr<Err = std::num::ParseIntError>,
    {
        value
            .parse()
            .map_err(|e| ConfigError::InvalidNumber { name, value, source: e })
    }

    fn non_empty_var(var_name: &str) -> Option<String> {
        env::var(var_name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
