//! Integration tests for Ontograph
//!
//! These tests drive the CLI against a snapshot directory and check the
//! result through the library.

use ontograph_core::{Dag, DagConfig, EdgeFlags};
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn ontograph(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ontograph"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("Failed to execute ontograph")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Test that the CLI can be invoked
#[test]
fn test_cli_invocation() {
    let output = Command::new(env!("CARGO_BIN_EXE_ontograph"))
        .arg("--help")
        .output()
        .expect("Failed to execute ontograph");

    let help = stdout(&output);
    assert!(help.contains("ontograph"));
    assert!(help.contains("Maintenance tool for an ontograph knowledge store"));
}

#[test]
fn test_assert_then_query() {
    let dir = TempDir::new().unwrap();

    let first = ontograph(dir.path(), &["assert", "(isa Cow Mammal)"]);
    assert!(first.status.success());
    assert!(stdout(&first).starts_with("Created edge 0"));

    let again = ontograph(dir.path(), &["assert", "(isa Cow Mammal)"]);
    assert!(again.status.success());
    assert!(stdout(&again).contains("already exists"));

    assert!(ontograph(dir.path(), &["assert", "(isa Mammal Animal)"]).status.success());

    let query = ontograph(dir.path(), &["query", "Mammal"]);
    assert_eq!(stdout(&query).lines().count(), 2);

    let subjects = ontograph(dir.path(), &["query", "Mammal", "--position", "2"]);
    assert_eq!(stdout(&subjects), "1\t(isa Mammal Animal)\n");

    let objects = ontograph(dir.path(), &["query", "Mammal", "--position", "-2"]);
    assert_eq!(stdout(&objects), "0\t(isa Cow Mammal)\n");
}

#[test]
fn test_invalid_edge_fails() {
    let dir = TempDir::new().unwrap();
    let output = ontograph(dir.path(), &["assert", "(isa Cow"]);
    assert!(!output.status.success());

    let missing = ontograph(dir.path(), &["query", "Nobody"]);
    assert!(!missing.status.success());
}

#[test]
fn test_lookup_aliases() {
    let dir = TempDir::new().unwrap();
    assert!(ontograph(dir.path(), &["assert", r#"(prettyString Cow "dairy cow")"#]).status.success());

    let exact = ontograph(dir.path(), &["lookup", "dairy cow"]);
    assert_eq!(stdout(&exact), "1\tCow\n");

    let prefix = ontograph(dir.path(), &["lookup", "DAIRY", "--ignore-case", "--prefix"]);
    assert_eq!(stdout(&prefix), "1\tCow\n");

    let wrong_case = ontograph(dir.path(), &["lookup", "DAIRY", "--prefix"]);
    assert_eq!(stdout(&wrong_case), "");
}

#[test]
fn test_remove_and_ground() {
    let dir = TempDir::new().unwrap();
    assert!(ontograph(dir.path(), &["assert", "(isa Cow Mammal)"]).status.success());
    assert!(ontograph(dir.path(), &["assert", "--ephemeral", "(isa Dog Mammal)"]).status.success());

    let ground = ontograph(dir.path(), &["ground"]);
    assert_eq!(stdout(&ground), "Grounded 1 edges\n");

    assert!(ontograph(dir.path(), &["remove", "Cow"]).status.success());

    let dag = Dag::open(DagConfig::with_root(dir.path())).unwrap();
    assert_eq!(dag.edge_count(), 1);
    assert_eq!(dag.ephemeral_edge_count(), 0);
    assert!(dag.find_node_by_name("Cow").is_none());
    let edge = dag
        .find_or_create_edge_text("(isa Dog Mammal)", None, EdgeFlags::FIND)
        .unwrap()
        .into_edge()
        .unwrap();
    assert!(!edge.is_ephemeral());
}

#[test]
fn test_library_and_cli_share_snapshots() {
    let dir = TempDir::new().unwrap();
    let dag = Dag::open(DagConfig::with_root(dir.path())).unwrap();
    dag.find_or_create_edge_text("(genls Mammal Vertebrate)", None, EdgeFlags::CREATE)
        .unwrap();
    assert!(dag.shutdown());

    let stats = stdout(&ontograph(dir.path(), &["stats"]));
    assert!(stats.contains("nodes:           3"));
    assert!(stats.contains("edges:           1"));
    assert!(stats.contains("modules:         RelatedEdgeModule, NodeAliasModule"));
}
