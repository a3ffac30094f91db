use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("chatflow").expect("binary builds");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("graph"))
        .stdout(predicate::str::contains("simulate"));
}

#[test]
fn version_prints_crate_version() {
    let mut cmd = Command::cargo_bin("chatflow").expect("binary builds");
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn validate_fails_on_missing_directory() {
    let mut cmd = Command::cargo_bin("chatflow").expect("binary builds");
    cmd.args(["validate", "/nonexistent/flows"]).assert().code(1);
}
