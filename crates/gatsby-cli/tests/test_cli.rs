use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

fn generate(path: &Path, extra: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    Command::cargo_bin("gatsby")?
        .arg("generate")
        .arg(path)
        .args(["--nodes", "60", "--feature-dim", "6"])
        .args(extra)
        .assert()
        .success()
        .stdout(predicate::str::contains("Generated 60 nodes"));
    Ok(())
}

fn small_model() -> [&'static str; 8] {
    ["--node-hidden-feats", "6", "--num-heads", "2", "--num-layers", "2", "--lr", "0.01"]
}

#[test]
fn test_cli_generate_and_stats() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let graph = dir.path().join("toy.bin");
    generate(&graph, &["--edge-feature-dim", "2"])?;

    Command::cargo_bin("gatsby")?
        .arg("stats")
        .arg(&graph)
        .assert()
        .success()
        .stdout(predicate::str::contains("Nodes:          60"))
        .stdout(predicate::str::contains("Edge features:  2"))
        .stdout(predicate::str::contains("Labels:         4 classes"))
        .stdout(predicate::str::contains("Splits:         36 / 12 / 12"));

    Command::cargo_bin("gatsby")?
        .arg("stats")
        .arg(&graph)
        .arg("--self-loop")
        .assert()
        .success()
        .stdout(predicate::str::contains("Zero in-degree: 0"))
        .stdout(predicate::str::contains("Self loops:     60"));
    Ok(())
}

#[test]
fn test_cli_train_writes_report_and_params() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let graph = dir.path().join("toy.json");
    let report = dir.path().join("report.json");
    let params = dir.path().join("params.safetensors");
    generate(&graph, &[])?;

    Command::cargo_bin("gatsby")?
        .arg("train")
        .arg(&graph)
        .args(small_model())
        .args(["--epochs", "3", "--monitor", "score", "--norm", "both"])
        .arg("--report")
        .arg(&report)
        .arg("--save-params")
        .arg(&params)
        .assert()
        .success()
        .stdout(predicate::str::contains("Training Summary"))
        .stdout(predicate::str::contains("Test accuracy"));

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report)?)?;
    assert_eq!(json["epochs"].as_array().map(Vec::len), Some(3));
    assert_eq!(json["monitor"], "score");
    assert_eq!(json["outcome"], "completed");
    assert!(params.exists());
    Ok(())
}

#[test]
fn test_cli_train_device_selection() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let graph = dir.path().join("toy.json");
    generate(&graph, &[])?;

    for device in ["cpu", "auto"] {
        Command::cargo_bin("gatsby")?
            .arg("train")
            .arg(&graph)
            .args(small_model())
            .args(["--epochs", "1", "--device", device])
            .assert()
            .success()
            .stdout(predicate::str::contains("Epochs run:  1"));
    }

    Command::cargo_bin("gatsby")?
        .arg("train")
        .arg(&graph)
        .args(["--device", "tpu"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn test_cli_train_mini_batch() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let graph = dir.path().join("toy.json");
    generate(&graph, &["--multi-label"])?;

    Command::cargo_bin("gatsby")?
        .arg("train")
        .arg(&graph)
        .args(small_model())
        .args(["--mode", "mini-batch", "--fanouts", "3,-1", "--batch-size", "8"])
        .args(["--epochs", "2", "--no-test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Valid rocauc"))
        .stdout(predicate::str::contains("Test").not());
    Ok(())
}

#[test]
fn test_cli_rejects_bad_configuration() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let graph = dir.path().join("toy.json");
    generate(&graph, &[])?;

    // two fanouts for three layers
    Command::cargo_bin("gatsby")?
        .arg("train")
        .arg(&graph)
        .args(["--mode", "mini-batch", "--fanouts", "3,3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("fanouts"));

    Command::cargo_bin("gatsby")?
        .arg("train")
        .arg(&graph)
        .args(["--batch-size", "8"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--mode mini-batch"));

    Command::cargo_bin("gatsby")?
        .arg("train")
        .arg(&graph)
        .args(["--norm", "sideways"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn test_cli_search() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let graph = dir.path().join("toy.json");
    let suggestions = dir.path().join("suggestions.json");
    let results = dir.path().join("results.json");
    generate(&graph, &[])?;
    fs::write(
        &suggestions,
        r#"[{"lr": 0.01, "num_heads": 1}, {"fanouts": "2"}, {"residual": true}]"#,
    )?;

    Command::cargo_bin("gatsby")?
        .arg("search")
        .arg(&graph)
        .args(["--node-hidden-feats", "4", "--num-layers", "1", "--epochs", "2"])
        .arg("--suggestions")
        .arg(&suggestions)
        .arg("--results")
        .arg(&results)
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"));

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&results)?)?;
    let trials = json.as_array().ok_or("results must be an array")?;
    assert_eq!(trials.len(), 3);
    assert!(trials.iter().all(|t| t["status"] == "completed"));
    Ok(())
}

#[test]
fn test_cli_search_aborts_on_unknown_hyperparameter() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let graph = dir.path().join("toy.json");
    let suggestions = dir.path().join("suggestions.json");
    generate(&graph, &[])?;
    fs::write(&suggestions, r#"[{"learning_rat": 0.01}]"#)?;

    Command::cargo_bin("gatsby")?
        .arg("search")
        .arg(&graph)
        .arg("--suggestions")
        .arg(&suggestions)
        .assert()
        .failure()
        .stderr(predicate::str::contains("learning_rat"));
    Ok(())
}
