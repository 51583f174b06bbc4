use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

/// Checks that survive a schema-valid document but still make no sense.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    if config.converter.command.is_empty()
        || config.converter.command[0].trim().is_empty()
    {
        return Err(ConfigError::Validation {
            message: "converter.command must name a program".to_string(),
        });
    }

    if config.converter.timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "converter.timeout_seconds must be positive".to_string(),
        });
    }

    if config.queue.lease_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "queue.lease_seconds must be positive".to_string(),
        });
    }

    // A lease shorter than the tool timeout redelivers jobs that are still running.
    if config.queue.lease_seconds <= config.converter.timeout_seconds {
        log::warn!(
            "queue.lease_seconds ({}) does not exceed converter.timeout_seconds ({}); \
             slow conversions will be redelivered while still running",
            config.queue.lease_seconds,
            config.converter.timeout_seconds
        );
    }

    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(ConfigError::Validation {
            message: "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{LogFormat, LogLevel};

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = load_config_from_str(r#"{ "version": "1.0" }"#).unwrap();

        assert_eq!(config.artifact_directory, "/data/rinex_files");
        assert!(config.worker_count >= 1);
        assert_eq!(config.queue.lease_seconds, 300);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_tool_failure_retries, 2);
        assert_eq!(
            config.converter.command,
            vec!["python3", "./android_rinex/bin/gnsslogger_to_rnx"]
        );
        assert_eq!(config.converter.timeout_seconds, 120);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_load_full_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "database_path": "/var/lib/riversense/jobs.db",
            "artifact_directory": "/srv/rinex",
            "worker_count": 3,
            "queue": { "lease_seconds": 600, "poll_interval_ms": 250 },
            "retry": { "max_retries": 3, "max_tool_failure_retries": 1, "base_delay_ms": 500, "max_delay_ms": 10000 },
            "converter": { "command": ["/opt/android_rinex/bin/gnsslogger_to_rnx"], "timeout_seconds": 30 },
            "logging": { "level": "debug", "format": "json" }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(
            config.database_path().unwrap(),
            std::path::PathBuf::from("/var/lib/riversense/jobs.db")
        );
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.queue.poll_interval().as_millis(), 250);
        assert_eq!(config.logging.format, LogFormat::Json);

        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay.as_millis(), 500);
        assert!(config.converter().is_some());
    }

    #[test]
    fn test_missing_version_fails_schema() {
        let result = load_config_from_str(r#"{ "worker_count": 2 }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_unknown_field_fails_schema() {
        let result = load_config_from_str(r#"{ "version": "1.0", "input_directory": "/in" }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = load_config_from_str(r#"{ "version": "1.0", "converter": { "command": [] } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = load_config_from_str(r#"{ "version": "1.0", "worker_count": 0 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "retry": { "base_delay_ms": 5000, "max_delay_ms": 100 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            load_config_from_str("{ not json"),
            Err(ConfigError::ParseJson(_))
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        validate_config(&Config::default()).unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("riversense.json");
        std::fs::write(&path, r#"{ "version": "1.0", "worker_count": 1 }"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.worker_count, 1);

        assert!(matches!(
            load_config(dir.path().join("missing.json")),
            Err(ConfigError::ReadFile { .. })
        ));
    }
}
