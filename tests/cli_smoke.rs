use serde_json::{Value, json};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_path(prefix: &str, ext: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}.{}", std::process::id(), nanos, ext));
    path
}

fn bdmm_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_bdmm"))
}

#[test]
fn cli_scores_trees_and_writes_tables() {
    let input = unique_temp_path("bdmm_cli_input", "json");
    let tsv = unique_temp_path("bdmm_cli_output", "tsv");
    let json_out = unique_temp_path("bdmm_cli_output", "json");
    let model = json!({
        "schedule": {
            "origin": 2.5,
            "birth": [[2.0]],
            "death": [[1.0]],
            "sampling": [[0.5]]
        },
        "trees": [
            { "name": "cherry", "nodes": [
                { "height": 1.0 },
                { "parent": 0, "height": 0.0 },
                { "parent": 0, "height": 0.0 }
            ] },
            { "nodes": [
                { "height": 2.0 },
                { "parent": 0, "height": 1.0 },
                { "parent": 1, "height": 0.0 },
                { "parent": 1, "height": 0.5 },
                { "parent": 0, "height": 0.2 }
            ] }
        ]
    });
    fs::write(&input, model.to_string()).expect("failed to write cli test input");

    let output = Command::new(bdmm_binary())
        .arg(&input)
        .arg("--no-progress")
        .arg("--output")
        .arg(&tsv)
        .arg("--json")
        .arg(&json_out)
        .output()
        .expect("failed to run bdmm binary");
    assert!(
        output.status.success(),
        "bdmm exited with non-zero status: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.lines().any(|l| l.starts_with("cherry\t")));

    let table = fs::read_to_string(&tsv).expect("failed to read tsv output");
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines[0], "tree\tstatus\tlog_likelihood\troot_prob_0");
    assert_eq!(lines.len(), 3);
    let fields: Vec<&str> = lines[1].split('\t').collect();
    assert_eq!(fields[0], "cherry");
    assert_eq!(fields[1], "scored");
    let ll: f64 = fields[2].parse().expect("log-likelihood is numeric");
    assert!((ll + 3.962008458275).abs() < 1e-6);
    assert!(lines[2].starts_with("tree_1\tscored\t"));

    let out = fs::read_to_string(&json_out).expect("failed to read json output");
    let v: Value = serde_json::from_str(&out).expect("output json is invalid");
    assert_eq!(v["engine"], "closed_form");
    assert_eq!(v["trees"].as_array().map(Vec::len), Some(2));

    let _ = fs::remove_file(&input);
    let _ = fs::remove_file(&tsv);
    let _ = fs::remove_file(&json_out);
}

#[test]
fn cli_rejects_missing_input() {
    let missing = unique_temp_path("bdmm_cli_missing", "json");
    let status = Command::new(bdmm_binary())
        .arg(&missing)
        .arg("--no-progress")
        .status()
        .expect("failed to run bdmm binary");
    assert!(!status.success());
}
