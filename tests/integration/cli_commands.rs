#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use csv::ReaderBuilder;
use serde_json::Value;
use tempfile::TempDir;

fn seeded_db(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.db"));
    cargo_bin_cmd!("biotrack")
        .args(["seed-demo", "--create"])
        .arg(&path)
        .assert()
        .success();
    (dir, path)
}

fn json_of(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("valid json")
}

#[test]
fn init_creates_the_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("fresh.db");
    cargo_bin_cmd!("biotrack").arg("init").arg(&path).assert().success();
    assert!(path.exists());
}

#[test]
fn commands_refuse_a_missing_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.db");
    cargo_bin_cmd!("biotrack")
        .arg("sequences")
        .arg(&path)
        .assert()
        .failure();
    assert!(!path.exists());
}

#[test]
fn seed_demo_reports_sample_ids() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("demo.db");
    let output = cargo_bin_cmd!("biotrack")
        .args(["--format", "json", "seed-demo", "--create"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = json_of(&output);
    assert_eq!(json["biosamples"], 3);
    assert_eq!(json["locations"], 2);
    assert_eq!(
        json["sample_ids"],
        serde_json::json!(["AN000001", "BL000001", "BL000002"])
    );
}

#[test]
fn next_id_reserves_consecutive_identifiers() {
    let (_dir, path) = seeded_db("next-id");
    let output = cargo_bin_cmd!("biotrack")
        .args(["--format", "json", "next-id"])
        .arg(&path)
        .args(["XY", "--count", "3"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = json_of(&output);
    assert_eq!(json["category"], "sample");
    assert_eq!(json["pattern"], "XY######");
    assert_eq!(json["ids"], serde_json::json!(["XY000001", "XY000002", "XY000003"]));

    let output = cargo_bin_cmd!("biotrack")
        .arg("next-id")
        .arg(&path)
        .args(["{StudyId}-##", "--study", "S-001", "--category", "container"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&output).trim(), "S-001-01");
}

#[test]
fn sequences_lists_counters() {
    let (_dir, path) = seeded_db("sequences");
    let output = cargo_bin_cmd!("biotrack")
        .args(["--format", "json", "sequences"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = json_of(&output);
    let rows = json.as_array().expect("array");
    assert!(rows
        .iter()
        .any(|r| r["pattern"] == "AN######" && r["last_barcode"] == "AN000020"));
    assert!(rows.iter().any(|r| r["category"] == "location"));
}

#[test]
fn export_writes_one_row_per_sample() {
    let (dir, path) = seeded_db("export");
    let out = dir.path().join("samples.csv");
    cargo_bin_cmd!("biotrack")
        .arg("export")
        .arg(&path)
        .arg("--samples")
        .arg(&out)
        .assert()
        .success();
    let mut reader = ReaderBuilder::new().from_path(&out).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(&headers[0], "sample_id");
    assert!(headers.iter().any(|h| h == "volume"));
    let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 3);
    let col = |name: &str| headers.iter().position(|h| h == name).unwrap();
    let plasma = rows
        .iter()
        .find(|r| &r[col("sample_id")] == "BL000001")
        .expect("plasma row");
    assert_eq!(&plasma[col("parent")], "AN000001");
    assert_eq!(&plasma[col("location")], "Freezer/Box 1");
    assert_eq!(&plasma[col("position")], "A1");
    assert_eq!(&plasma[col("dose")], "1");
    let mouse = rows
        .iter()
        .find(|r| &r[col("sample_id")] == "AN000001")
        .expect("mouse row");
    assert_eq!(&mouse[col("study")], "S-001");
    assert_eq!(&mouse[col("container_type")], "cage");
}

#[test]
fn import_adds_and_updates_samples() {
    let (dir, path) = seeded_db("import");
    let input = dir.path().join("in.csv");
    fs::write(
        &input,
        "sample_id,biotype,parent,location,position,volume\n\
         ,Blood,AN000001,Freezer/Box 1,A3,2\n\
         BL000001,,,,,4\n",
    )
    .unwrap();
    let output = cargo_bin_cmd!("biotrack")
        .args(["--format", "json", "--user", "importer", "import"])
        .arg(&path)
        .arg("--samples")
        .arg(&input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = json_of(&output);
    assert_eq!(json["inserted"], 1);
    assert_eq!(json["updated"], 1);

    let out = dir.path().join("after.csv");
    cargo_bin_cmd!("biotrack")
        .arg("export")
        .arg(&path)
        .arg("--samples")
        .arg(&out)
        .assert()
        .success();
    let mut reader = ReaderBuilder::new().from_path(&out).unwrap();
    let headers = reader.headers().unwrap().clone();
    let col = |name: &str| headers.iter().position(|h| h == name).unwrap();
    let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 4);
    let plasma = rows
        .iter()
        .find(|r| &r[col("sample_id")] == "BL000001")
        .unwrap();
    assert_eq!(&plasma[col("volume")], "4");
    assert_eq!(&plasma[col("dose")], "8");
    assert!(rows.iter().any(|r| &r[col("position")] == "A3"));
}

#[test]
fn import_rejects_an_occupied_slot_without_writing() {
    let (dir, path) = seeded_db("import-clash");
    let input = dir.path().join("clash.csv");
    fs::write(
        &input,
        "biotype,location,position,volume\n\
         Blood,Freezer/Box 1,A5,1\n\
         Blood,Freezer/Box 1,A1,1\n",
    )
    .unwrap();
    cargo_bin_cmd!("biotrack")
        .arg("import")
        .arg(&path)
        .arg("--samples")
        .arg(&input)
        .assert()
        .failure();

    let out = dir.path().join("after.csv");
    cargo_bin_cmd!("biotrack")
        .arg("export")
        .arg(&path)
        .arg("--samples")
        .arg(&out)
        .assert()
        .success();
    let rows = ReaderBuilder::new()
        .from_path(&out)
        .unwrap()
        .records()
        .count();
    assert_eq!(rows, 3);
}
