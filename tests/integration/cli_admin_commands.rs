#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn seeded_cluster() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("cluster");
    cargo_bin_cmd!("heapvac")
        .args(["--page-size", "1024", "init"])
        .arg(&path)
        .assert()
        .success();
    cargo_bin_cmd!("heapvac")
        .args(["seed-demo", "--rows", "200", "--row-width", "32"])
        .arg(&path)
        .assert()
        .success();
    (dir, path)
}

fn json_output(args: &[&str], path: &PathBuf) -> Value {
    let output = cargo_bin_cmd!("heapvac")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn init_creates_cluster_files() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("fresh");
    let report = json_output(&["init"], &path);
    assert_eq!(report["database"], "postgres");
    assert_eq!(report["page_size"], 8192);
    assert!(path.join("pg_database.json").exists());
}

#[test]
fn stats_lists_seeded_table() {
    let (_dir, path) = seeded_cluster();
    let report = json_output(&["stats"], &path);
    let relations = report["relations"].as_array().expect("relations");
    let demo = relations
        .iter()
        .find(|r| r["relation"] == "public.demo")
        .expect("demo table");
    assert!(demo["nblocks"].as_u64().expect("nblocks") > 1);
    assert_eq!(demo["indexes"], 1);
    assert_eq!(report["databases"][0]["name"], "postgres");
}

#[test]
fn vacuum_full_reports_and_shrinks() {
    let (_dir, path) = seeded_cluster();
    let before = json_output(&["stats"], &path);
    let pages_before = before["relations"]
        .as_array()
        .expect("relations")
        .iter()
        .find(|r| r["relation"] == "public.demo")
        .and_then(|r| r["nblocks"].as_u64())
        .expect("nblocks");

    let output = cargo_bin_cmd!("heapvac")
        .args(["--format", "json", "vacuum", "--full"])
        .arg(&path)
        .arg("demo")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(report["full"], true);
    assert_eq!(report["database_wide"], false);
    let entry = &report["relations"][0];
    assert_eq!(entry["outcome"], "vacuumed");
    // 100 deleted rows plus the versions superseded by 20 updates.
    assert_eq!(entry["removed"], 120);
    assert!(entry["pages_after"].as_u64().expect("pages_after") < pages_before);

    let after = json_output(&["stats"], &path);
    let demo = after["relations"]
        .as_array()
        .expect("relations")
        .iter()
        .find(|r| r["relation"] == "public.demo")
        .cloned()
        .expect("demo table");
    assert_eq!(demo["stats"]["tuples"], 100);
}

#[test]
fn vacuum_text_output_names_relations() {
    let (_dir, path) = seeded_cluster();
    let output = cargo_bin_cmd!("heapvac")
        .args(["vacuum", "--verbose"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("public.demo: removed=120"), "{text}");
    assert!(text.contains("watermarks_advanced=true"), "{text}");
}

#[test]
fn non_superuser_stranger_gets_skip_warning() {
    let (_dir, path) = seeded_cluster();
    let output = cargo_bin_cmd!("heapvac")
        .args(["--role", "42", "--no-superuser", "vacuum"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("only table or database owner can vacuum it"), "{text}");
}

#[test]
fn missing_cluster_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("heapvac")
        .arg("stats")
        .arg(dir.path().join("nowhere"))
        .assert()
        .failure();
}

#[test]
fn config_file_supplies_cluster_and_vacuum_settings() {
    let (dir, path) = seeded_cluster();
    let config = dir.path().join("cli.toml");
    fs::write(
        &config,
        format!(
            "[cluster]\ncluster = {:?}\n\n[vacuum]\nvacuum_mem_kb = 0\n",
            path.display().to_string()
        ),
    )
    .expect("write config");
    let output = cargo_bin_cmd!("heapvac")
        .args(["--format", "json", "--config"])
        .arg(&config)
        .arg("vacuum")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).expect("json output");
    let demo = report["relations"]
        .as_array()
        .expect("relations")
        .iter()
        .find(|r| r["relation"] == "public.demo")
        .cloned()
        .expect("demo table");
    assert!(demo["index_scans"].as_u64().expect("index_scans") > 1);
}
