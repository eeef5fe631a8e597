//! Config loading from disk.

use ut_server::config::{ConfigError, load_config_from_path};

#[test]
fn loads_from_a_toml_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.toml");
    std::fs::write(
        &path,
        "rpc_port = 9100\nweb_port = 9101\nworkers = 3\nlimit_heartbeat_interval_ms = 500\n",
    )
    .expect("write");

    let cfg = load_config_from_path(&path).expect("load");
    assert_eq!(cfg.rpc_port, 9100);
    assert_eq!(cfg.web_port, 9101);
    assert_eq!(cfg.workers, 3);
    assert_eq!(
        cfg.limit_heartbeat_interval,
        std::time::Duration::from_millis(500)
    );
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = load_config_from_path(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.toml");
    std::fs::write(&path, "rpc_port = [not a number").expect("write");
    let err = load_config_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}
