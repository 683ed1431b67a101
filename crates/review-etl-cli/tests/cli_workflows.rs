//! Integration tests for the CLI binary: build a store, then query it.

use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

mod common;

use common::{SAMPLE_CSV, cli, path_arg, store_root, write_input};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn build_sample(tmp: &TempDir, extra: &[&str]) -> TestResult {
    let input = write_input(tmp.path(), "reviews.csv", SAMPLE_CSV)?;
    let store = path_arg(&store_root(tmp));
    let input = path_arg(&input);
    let mut args = vec!["--store", store.as_str(), "build", "--input", input.as_str()];
    args.extend_from_slice(extra);
    cli()
        .args(&args)
        .assert()
        .success()
        .stdout(contains("Published snapshot"));
    Ok(())
}

fn query_json(tmp: &TempDir, args: &[&str]) -> Result<Value, Box<dyn std::error::Error>> {
    let store = path_arg(&store_root(tmp));
    let mut full = vec!["--store", store.as_str(), "--format", "json"];
    full.extend_from_slice(args);
    let output = cli().args(&full).assert().success().get_output().stdout.clone();
    Ok(serde_json::from_slice(&output)?)
}

#[test]
fn build_reports_counts_and_steps() -> TestResult {
    let tmp = TempDir::new()?;
    let input = write_input(tmp.path(), "reviews.csv", SAMPLE_CSV)?;
    let store = path_arg(&store_root(&tmp));

    cli()
        .args(["--store", store.as_str(), "build", "--input", path_arg(&input).as_str()])
        .assert()
        .success()
        .stdout(contains("Published snapshot 1: 4 of 6 rows cleaned, 1 rejected, 1 duplicates"))
        .stdout(contains("missing_rating"))
        .stdout(contains("normalize"));

    assert!(store_root(&tmp).join("CURRENT").exists());
    Ok(())
}

#[test]
fn get_returns_cleaned_records_as_json() -> TestResult {
    let tmp = TempDir::new()?;
    build_sample(&tmp, &["--window", "2"])?;

    let body = query_json(&tmp, &["get", "P1"])?;
    assert_eq!(body["summary"]["name"], "Wireless Mouse");
    assert_eq!(body["records"].as_array().map(Vec::len), Some(2));
    let last = &body["aggregates"][1];
    assert_eq!(last["mean"], 4.5);
    assert_eq!(last["count"], 2);
    assert_eq!(last["partial"], false);

    let body = query_json(&tmp, &["sentiment", "P2"])?;
    assert_eq!(body["latest_sentiment_score"], 3.0);
    Ok(())
}

#[test]
fn list_pages_through_entities() -> TestResult {
    let tmp = TempDir::new()?;
    build_sample(&tmp, &[])?;

    let first = query_json(&tmp, &["list", "--limit", "2"])?;
    let keys: Vec<_> = first["items"]
        .as_array()
        .ok_or("items")?
        .iter()
        .map(|i| i["entity"].clone())
        .collect();
    assert_eq!(keys, vec!["P1", "P2"]);
    let token = first["next_page"].as_str().ok_or("next_page")?.to_string();

    let second = query_json(&tmp, &["list", "--limit", "2", "--page", token.as_str()])?;
    assert_eq!(second["items"][0]["entity"], "P3");
    assert!(second["next_page"].is_null());
    Ok(())
}

#[test]
fn unknown_entity_fails_with_not_found() -> TestResult {
    let tmp = TempDir::new()?;
    build_sample(&tmp, &[])?;
    let store = path_arg(&store_root(&tmp));

    cli()
        .args(["--store", store.as_str(), "get", "NOPE"])
        .assert()
        .failure()
        .stderr(contains("error[not_found]"));

    cli()
        .args(["--store", store.as_str(), "serve-request", "/entities/UNKNOWN"])
        .assert()
        .success()
        .stdout(contains(r#"404 {"error":"not_found"}"#));

    cli()
        .args(["--store", store.as_str(), "serve-request", "/entities?limit=0"])
        .assert()
        .success()
        .stdout(contains("400 "))
        .stdout(contains("validation_error"));
    Ok(())
}

#[test]
fn query_before_any_build_explains_what_to_do() -> TestResult {
    let tmp = TempDir::new()?;
    let store = path_arg(&store_root(&tmp));

    cli()
        .args(["--store", store.as_str(), "health"])
        .assert()
        .failure()
        .stderr(contains("error[store_error]"))
        .stderr(contains("review-etl build"));
    Ok(())
}

#[test]
fn missing_input_is_an_input_error() -> TestResult {
    let tmp = TempDir::new()?;
    let store = path_arg(&store_root(&tmp));
    let missing = path_arg(&tmp.path().join("nope.csv"));

    cli()
        .args(["--store", store.as_str(), "build", "--input", missing.as_str()])
        .assert()
        .failure()
        .stderr(contains("error[input_error]"))
        .stderr(contains("nope.csv"));
    assert!(!store_root(&tmp).join("CURRENT").exists());
    Ok(())
}

#[test]
fn flags_override_config_file() -> TestResult {
    let tmp = TempDir::new()?;
    let input = write_input(tmp.path(), "reviews.csv", SAMPLE_CSV)?;
    let config = tmp.path().join("etl.json");
    let cfg = serde_json::json!({
        "input": { "path": path_arg(&input) },
        "store_path": path_arg(&store_root(&tmp)),
        "window": { "size": 5, "partial": "suppress" }
    });
    std::fs::write(&config, serde_json::to_vec_pretty(&cfg)?)?;
    let config = path_arg(&config);

    cli()
        .args(["--config", config.as_str(), "build", "--window", "2"])
        .assert()
        .success();

    let output = cli()
        .args(["--config", config.as_str(), "--format", "json", "aggregates", "P1"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let aggs: Value = serde_json::from_slice(&output)?;
    let aggs = aggs.as_array().ok_or("list")?;
    assert_eq!(aggs.len(), 1);
    assert_eq!(aggs[0]["count"], 2);
    Ok(())
}

#[test]
fn serve_request_checks_configured_api_key() -> TestResult {
    let tmp = TempDir::new()?;
    build_sample(&tmp, &[])?;
    let config = tmp.path().join("serve.json");
    let cfg = serde_json::json!({
        "store_path": path_arg(&store_root(&tmp)),
        "api_key": "s3cret"
    });
    std::fs::write(&config, serde_json::to_vec_pretty(&cfg)?)?;
    let config = path_arg(&config);

    cli()
        .args(["--config", config.as_str(), "serve-request", "/entities/P1"])
        .assert()
        .success()
        .stdout(contains("403 "))
        .stdout(contains(r#""error":"forbidden""#));

    cli()
        .args(["--config", config.as_str(), "serve-request", "/entities/P1", "--api-key", "s3cret"])
        .assert()
        .success()
        .stdout(contains("200 "))
        .stdout(contains("Wireless Mouse"));

    cli()
        .args(["--config", config.as_str(), "serve-request", "/health"])
        .assert()
        .success()
        .stdout(contains("200 "));
    Ok(())
}

#[test]
fn impute_value_needs_impute_policy() -> TestResult {
    let tmp = TempDir::new()?;
    let input = write_input(tmp.path(), "reviews.csv", SAMPLE_CSV)?;
    let store = path_arg(&store_root(&tmp));

    cli()
        .args([
            "--store",
            store.as_str(),
            "build",
            "--input",
            path_arg(&input).as_str(),
            "--impute-value",
            "3",
        ])
        .assert()
        .failure()
        .stderr(contains("error[config_error]"));

    cli()
        .args([
            "--store",
            store.as_str(),
            "build",
            "--input",
            path_arg(&input).as_str(),
            "--missing",
            "impute",
            "--impute-value",
            "3",
        ])
        .assert()
        .success()
        .stdout(contains("5 of 6 rows cleaned, 0 rejected, 1 duplicates, 1 imputed"));
    Ok(())
}

#[test]
fn rebuild_publishes_next_version() -> TestResult {
    let tmp = TempDir::new()?;
    build_sample(&tmp, &[])?;
    build_sample(&tmp, &["--retain", "0"])?;

    let health = query_json(&tmp, &["health"])?;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["snapshot_version"], 2);
    assert_eq!(health["entity_count"], 3);
    assert!(!store_root(&tmp).join("snapshots").join(format!("{:010}", 1)).exists());
    Ok(())
}
