//! Unit tests for kura-core

use std::path::PathBuf;

use kura_core::{
    config::{Config, DataDirectories, LogFormat, LogLevel},
    Error,
};

mod config_tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.storage.coalesce_window_ms, 100);
        assert_eq!(config.coalesce.threshold_bytes, 64 * 1024);
        assert_eq!(config.coalesce.max_delay_ms, 1000);
        assert!(config.pool.zero_on_release);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let text = r#"
            [storage]
            max_concurrent_ops = 4
            cache_max_bytes = 1000
            coalesce_window_ms = 20

            [storage.data_directories]
            primary = "/srv/kura"

            [monitoring.logging]
            level = "debug"
            format = "json"
        "#;

        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.storage.max_concurrent_ops, 4);
        assert_eq!(config.storage.cache_max_bytes, 1000);
        assert_eq!(config.storage.data_directories.primary, PathBuf::from("/srv/kura"));
        // untouched keys fall back to defaults
        assert_eq!(config.storage.data_directories.cache, PathBuf::from("./data/cache"));
        assert_eq!(config.scheduler.read_weight, 2);
        assert_eq!(config.monitoring.logging.level, LogLevel::Debug);
        assert_eq!(config.monitoring.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = Config::default();
        config.storage.data_directories = DataDirectories::under("/var/lib/kura");
        let text = toml::to_string(&config).unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = Config::default();
        config.storage.max_concurrent_ops = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));

        let mut config = Config::default();
        config.coalesce.threshold_bytes = config.storage.write_buffer_bytes + 1;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));

        let mut config = Config::default();
        config.coalesce.max_delay_ms = 10;
        config.storage.coalesce_window_ms = 50;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));

        let err = Config::from_toml_str("[storage]\nmax_concurrent_ops = \"lots\"").unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kura.toml");
        std::fs::write(&path, "[cache]\nshards = 4\nttl_ms = 500\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.cache.shards, 4);
        assert_eq!(config.cache.ttl().as_millis(), 500);

        let missing = Config::load(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(Error::Configuration { .. })));
    }
}
