//! Integration tests for `cograph graph` commands via CLI.

mod common;

use common::TestEnv;
use predicates::prelude::*;

#[test]
fn test_graph_list_empty() {
    let env = TestEnv::new();

    env.cograph()
        .args(["graph", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"count\":0"));
}

#[test]
fn test_graph_create_and_list() {
    let env = TestEnv::new();

    env.cograph()
        .args(["graph", "create", "Biology", "-d", "Cells and such", "--public"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"title\":\"Biology\""))
        .stdout(predicate::str::contains("\"visibility\":\"public\""))
        .stdout(predicate::str::contains("\"id\":\"g-"));

    env.cograph()
        .args(["graph", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"count\":1"))
        .stdout(predicate::str::contains("Biology"));

    assert!(env.database_path().exists());
}

#[test]
fn test_graph_show_empty_graph() {
    let env = TestEnv::new();
    let id = env.create_graph("Empty");

    env.cograph()
        .args(["graph", "show", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("\"id\":\"{}\"", id)))
        .stdout(predicate::str::contains("\"nodes\":[]"))
        .stdout(predicate::str::contains("\"edges\":[]"));
}

#[test]
fn test_graph_show_human() {
    let env = TestEnv::new();
    let id = env.create_graph("Readable");

    env.cograph()
        .args(["-H", "graph", "show", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"Readable\""))
        .stdout(predicate::str::contains("0 nodes, 0 edges"));
}

#[test]
fn test_graph_delete() {
    let env = TestEnv::new();
    let id = env.create_graph("Doomed");

    env.cograph()
        .args(["graph", "delete", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("\"deleted\":\"{}\"", id)));

    env.cograph()
        .args(["graph", "show", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("\"error\""));
}

#[test]
fn test_graph_delete_unknown_fails() {
    let env = TestEnv::new();

    env.cograph()
        .args(["graph", "delete", "g-missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_graph_create_blank_title_fails_human() {
    let env = TestEnv::new();

    env.cograph()
        .args(["-H", "graph", "create", "   "])
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("Error:"));
}
