use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;

fn sample(time_diff: f64, status_1: &str, status_2: &str) -> serde_json::Value {
    json!({
        "time_diff": time_diff,
        "first": {"status": 200, "headers": {}, "cache_status": status_1},
        "second": {"status": 200, "headers": {}, "cache_status": status_2},
    })
}

fn fixture_bundle() -> serde_json::Value {
    let randomized: Vec<_> = [0.4, -0.7, 1.1, -0.2, 0.9, -1.3, 0.6, 0.1, -0.5, 0.8]
        .iter()
        .map(|d| sample(*d, "MISS", "MISS"))
        .collect();
    let fixed: Vec<_> = [-38.2, -41.5, -39.9, -40.8, -37.6, -42.1, -40.2, -39.1, -41.0, -38.8]
        .iter()
        .map(|d| sample(*d, "MISS", "HIT"))
        .collect();
    json!({
        "https://target/profile": {
            "": {
                "direct": {"randomized": randomized, "fixed": fixed}
            }
        }
    })
}

#[test]
fn analyse_writes_verdict_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("output");
    std::fs::create_dir_all(&out_dir).unwrap();
    let bundle_path = out_dir.join("target-2024-05-06-07-08-09.json");
    std::fs::write(
        &bundle_path,
        serde_json::to_vec_pretty(&fixture_bundle()).unwrap(),
    )
    .unwrap();

    Command::cargo_bin("cachetime")
        .unwrap()
        .args([
            "analyse",
            bundle_path.to_str().unwrap(),
            "--out-dir",
            tmp.path().to_str().unwrap(),
            "--requests",
            "10",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("CACHE"));

    let artifact = tmp.path().join("analysis").join("target-10.json");
    let verdict: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&artifact).unwrap()).unwrap();
    assert_eq!(verdict["statistics_prediction"], "CACHE");
    assert_eq!(verdict["label"], "CACHE");
    assert_eq!(verdict["randomized"].as_array().unwrap().len(), 10);
}

#[test]
fn analyse_skips_already_analysed_sites() {
    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("output");
    let analysis_dir = tmp.path().join("analysis");
    std::fs::create_dir_all(&out_dir).unwrap();
    std::fs::create_dir_all(&analysis_dir).unwrap();

    let bundle_path = out_dir.join("target-2024-05-06-07-08-09.json");
    std::fs::write(
        &bundle_path,
        serde_json::to_vec_pretty(&fixture_bundle()).unwrap(),
    )
    .unwrap();
    // Pre-existing artifact for the same site and pair count.
    std::fs::write(analysis_dir.join("target-10.json"), b"{}").unwrap();

    Command::cargo_bin("cachetime")
        .unwrap()
        .args([
            "analyse",
            bundle_path.to_str().unwrap(),
            "--out-dir",
            tmp.path().to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("CACHE").not());
}

#[test]
fn analyse_fails_on_missing_bundle() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("cachetime")
        .unwrap()
        .args([
            "analyse",
            tmp.path().join("output").join("nope-2024-01-01-01-01-01.json").to_str().unwrap(),
            "--out-dir",
            tmp.path().to_str().unwrap(),
        ])
        .assert()
        .failure();
}

#[test]
fn help_lists_the_three_scan_modes() {
    Command::cargo_bin("cachetime")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("preliminary")
                .and(predicate::str::contains("hidden-caches"))
                .and(predicate::str::contains("wcd")),
        );
}
