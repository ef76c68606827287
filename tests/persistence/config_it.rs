use kvshard::{
    Bucket, ConfigError, EngineConfig, EngineError, InMemoryStore, RemovalMode, ShardState,
    SharedMetricsRegistry,
};
use std::io::Write;
use std::sync::Arc;

#[test]
fn config_file_overrides_only_what_it_names() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "checkpoint": {{ "removal_mode": "lazy", "memory_quota_bytes": 4096 }},
            "flusher": {{ "batch_split_trigger": 64 }}
        }}"#
    )
    .unwrap();

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.checkpoint.removal_mode, RemovalMode::Lazy);
    assert_eq!(config.checkpoint.memory_quota_bytes, 4096);
    assert_eq!(config.flusher.batch_split_trigger, 64);
    assert_eq!(config.durability, EngineConfig::default().durability);
    assert!(config.persistent);
}

#[test]
fn missing_config_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn invalid_config_refuses_to_build_a_bucket() {
    let mut config = EngineConfig::default();
    config.checkpoint.memory_recovery_lower_mark = 0.9;
    config.checkpoint.memory_recovery_upper_mark = 0.5;
    let err = Bucket::new(
        config,
        1,
        ShardState::Active,
        Arc::new(InMemoryStore::new()),
        SharedMetricsRegistry::for_engine(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Config(ConfigError::Invalid {
            field: "checkpoint.memory_recovery_lower_mark",
            ..
        })
    ));
}
