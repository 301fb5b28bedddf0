use std::process::Command;

#[test]
fn help_lists_server_flags() {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("agentrix"))
        .arg("--help")
        .output()
        .expect("run agentrix --help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--host", "--port", "--workdir", "--config", "--allow-origin"] {
        assert!(stdout.contains(flag), "missing {flag} in:\n{stdout}");
    }
}

#[test]
fn version_matches_package() {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("agentrix"))
        .arg("--version")
        .output()
        .expect("run agentrix --version");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unreadable_config_fails_fast() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = Command::new(assert_cmd::cargo::cargo_bin!("agentrix"))
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("--port")
        .arg("0")
        .output()
        .expect("run agentrix");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing.toml"));
}
