use super::*;

#[test]
fn default_config_has_sane_store_settings() {
    let config = Config::default();
    assert_eq!(config.store.flush_batch_size, 500);
    assert_eq!(config.store.retention_days, Some(90));
}

#[test]
fn retention_days_zero_disables_cleanup() {
    let section = StoreSection::from_file(Some(sections::FileStoreSection {
        retention_days: Some(0),
        ..Default::default()
    }));
    assert_eq!(section.retention_days, None);
}

#[test]
fn log_rotation_parses_unknown_as_daily() {
    assert_eq!(LogRotation::from_str("weekly"), LogRotation::Daily);
    assert_eq!(LogRotation::from_str("Hourly"), LogRotation::Hourly);
}

#[test]
fn db_path_and_scripts_dir_are_under_data_dir() {
    let config = Config {
        data_dir: PathBuf::from("/tmp/devbench-test"),
        ..Config::default()
    };
    assert_eq!(config.db_path(), PathBuf::from("/tmp/devbench-test/events.db"));
    assert_eq!(config.scripts_dir(), PathBuf::from("/tmp/devbench-test/scripts"));
}

#[test]
fn to_toml_round_trips_through_from_str() {
    let config = Config::default();
    let toml_str = config.to_toml();
    let parsed: FileConfig = toml::from_str(&toml_str).expect("generated config must parse");
    assert_eq!(parsed.adb_binary.as_deref(), Some("adb"));
}
