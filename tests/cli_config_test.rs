//! Integration tests for `cograph config` commands via CLI.

mod common;

use common::TestEnv;
use predicates::prelude::*;

#[test]
fn test_config_show_defaults() {
    let env = TestEnv::new();

    env.cograph()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"exists\":false"))
        .stdout(predicate::str::contains(
            "\"port\":{\"value\":3055,\"source\":\"default\"}",
        ))
        .stdout(predicate::str::contains("env:COGRAPH_DATA_DIR"));
}

#[test]
fn test_config_init_then_show_reads_file() {
    let env = TestEnv::new();

    env.cograph()
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"path\""));
    assert!(env.config_path().exists());

    env.cograph()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"exists\":true"))
        .stdout(predicate::str::contains(
            "\"port\":{\"value\":3055,\"source\":\"config\"}",
        ));
}

#[test]
fn test_config_init_refuses_overwrite() {
    let env = TestEnv::new();
    env.cograph().args(["config", "init"]).assert().success();

    env.cograph()
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    env.cograph()
        .args(["config", "init", "--force"])
        .assert()
        .success();
}

#[test]
fn test_config_file_values_are_used() {
    let env = TestEnv::new();
    std::fs::write(
        env.config_path(),
        "server {\n    host \"0.0.0.0\"\n    port 4100\n}\nlayout {\n    distance 45.0\n}\n",
    )
    .unwrap();

    env.cograph()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "\"host\":{\"value\":\"0.0.0.0\",\"source\":\"config\"}",
        ))
        .stdout(predicate::str::contains("\"layout_source\":\"config\""));
}

#[test]
fn test_config_invalid_file_fails() {
    let env = TestEnv::new();
    std::fs::write(env.config_path(), "server {\n    port \"not a number\"\n").unwrap();

    env.cograph()
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config error"));
}
