//! Runtime configuration
//!
//! Read from the process environment (after `.env` has been loaded by the
//! binary). Every value has a default so the pipeline runs with no setup.

use std::env;
use std::str::FromStr;

use crate::error::AtomicOpsError;
use crate::verification::{SafetyLevel, VerificationMode};
use crate::Result;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://atomic_ops.db";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub verification_mode: VerificationMode,
    pub safety_level: SafetyLevel,
    pub max_decomposition_depth: usize,
    pub correction_limit: usize,
    pub blocked_commands: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub api_port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            verification_mode: VerificationMode::Standard,
            safety_level: SafetyLevel::Standard,
            max_decomposition_depth: 3,
            correction_limit: 5,
            blocked_commands: Vec::new(),
            allowed_paths: Vec::new(),
            api_port: 8080,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let gemini_api_key = env::var("GEMINI_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        let api_port = match env::var("PORT").or_else(|_| env::var("API_PORT")) {
            Ok(raw) => parse_value("PORT", &raw)?,
            Err(_) => defaults.api_port,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            gemini_api_key,
            gemini_model: env::var("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            verification_mode: env_or("VERIFICATION_MODE", defaults.verification_mode)?,
            safety_level: env_or("SAFETY_LEVEL", defaults.safety_level)?,
            max_decomposition_depth: env_or(
                "MAX_DECOMPOSITION_DEPTH",
                defaults.max_decomposition_depth,
            )?,
            correction_limit: env_or("CORRECTION_LIMIT", defaults.correction_limit)?,
            blocked_commands: env_list("BLOCKED_COMMANDS"),
            allowed_paths: env_list("ALLOWED_PATHS"),
            api_port,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => parse_value(key, &raw),
        _ => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| AtomicOpsError::ConfigError(format!("{}={}: {}", key, raw, e)))
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key).map(|raw| split_list(&raw)).unwrap_or_default()
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_decomposition_depth, 3);
        assert_eq!(config.correction_limit, 5);
        assert_eq!(config.verification_mode, VerificationMode::Standard);
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" shred, ,dd ,"), vec!["shred", "dd"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_parse_value_reports_key() {
        let err = parse_value::<usize>("MAX_DECOMPOSITION_DEPTH", "deep").unwrap_err();
        assert!(err.to_string().contains("MAX_DECOMPOSITION_DEPTH"));
    }
}
