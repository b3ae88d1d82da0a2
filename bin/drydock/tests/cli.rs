use std::process::{Command, Output};

fn drydock(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_drydock"))
        .args(args)
        .env_remove("DRYDOCK_LOG_FILE")
        .env_remove("DRYDOCK_LOG_FORMAT_JSON")
        .output()
        .unwrap()
}

#[test]
fn no_action_prints_help() {
    let output = drydock(&[]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Usage:"));
}

#[test]
fn conflicting_actions_print_help() {
    let cases: [&[&str]; 3] = [&["-b", "-d"], &["--start", "--stop", "--logs"], &["-w"]];
    for args in cases {
        let output = drydock(args);

        assert_eq!(output.status.code(), Some(2), "args: {:?}", args);
        assert!(String::from_utf8_lossy(&output.stdout).contains("--deploy"));
    }
}

#[test]
fn unknown_flag_is_a_usage_error() {
    assert_eq!(drydock(&["--launch"]).status.code(), Some(2));
}

#[test]
fn missing_service_file_fails() {
    let workdir = tempfile::tempdir().unwrap();
    let config = workdir.path().join("drydock.yaml");

    let output = drydock(&["--stop", "--config", config.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

#[test]
fn invalid_service_file_fails() {
    let workdir = tempfile::tempdir().unwrap();
    let config = workdir.path().join("drydock.yaml");
    std::fs::write(&config, "title: search\ntenant: acme\nversion: ''\n").unwrap();

    let output = drydock(&["--monitor", "--config", config.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    assert!(!String::from_utf8_lossy(&output.stderr).is_empty());
}
