use backlog_config::AdapterConfig;

#[test]
fn explicit_path_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backlog-dap.toml");
    std::fs::write(&path, "[attach]\naddress = \"10.0.0.5:1099\"\nconnect_attempts = 3\n").unwrap();

    let (config, found) = AdapterConfig::discover(Some(&path)).unwrap();
    assert_eq!(found.as_deref(), Some(path.as_path()));
    assert_eq!(config.attach.address, "10.0.0.5:1099");
    assert_eq!(config.attach.connect_attempts, 3);
}

#[test]
fn explicit_path_errors_propagate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[session\n").unwrap();

    assert!(AdapterConfig::discover(Some(&path)).is_err());
}
