#![allow(missing_docs)]

use std::io;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;

use arrow::array::{Float64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn cli_bin() -> &'static str {
    env!("CARGO_BIN_EXE_tickstore")
}

fn run_cli(args: &[&str]) -> io::Result<Output> {
    Command::new(cli_bin()).args(args).output()
}

fn assert_cli_success(output: &Output) {
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_daily_parquet(path: &Path, rows: &[(&str, &str, f64)]) -> TestResult {
    let mut codes = StringBuilder::new();
    let mut dates = StringBuilder::new();
    let mut close = Float64Builder::new();
    for (code, date, value) in rows {
        codes.append_value(code);
        dates.append_value(date);
        close.append_value(*value);
    }
    let schema = Arc::new(Schema::new(vec![
        Field::new("ts_code", DataType::Utf8, true),
        Field::new("trade_date", DataType::Utf8, true),
        Field::new("close", DataType::Float64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(codes.finish()),
            Arc::new(dates.finish()),
            Arc::new(close.finish()),
        ],
    )?;
    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

#[test]
fn ingest_then_scan_and_plan() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path().join("store");
    let root_str = root.to_string_lossy().to_string();
    let input = tmp.path().join("daily.parquet");
    write_daily_parquet(
        &input,
        &[
            ("000001.SZ", "20230103", 10.0),
            ("000001.SZ", "20230104", 10.5),
            ("600000.SH", "20230104", 7.1),
        ],
    )?;
    let input_str = input.to_string_lossy().to_string();

    let out = run_cli(&[
        "ingest",
        "--root",
        &root_str,
        "--data-type",
        "daily",
        "--parquet",
        &input_str,
    ])?;
    assert_cli_success(&out);
    assert!(stdout(&out).contains("year=2023"));
    assert!(root.join("daily/year=2023/data.parquet").exists());

    let out = run_cli(&["scan", "--root", &root_str, "--data-type", "daily", "--json"])?;
    assert_cli_success(&out);
    let map: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(map["status"], "populated");
    assert_eq!(map["rows"], 3);
    assert_eq!(map["subjects"]["1"]["first"], "20230103");
    assert_eq!(map["subjects"]["2"]["covered_dates"], 1);

    let out = run_cli(&[
        "plan",
        "--root",
        &root_str,
        "--data-type",
        "daily",
        "--start",
        "2023-01-04",
        "--end",
        "2023-01-05",
        "--json",
    ])?;
    assert_cli_success(&out);
    let items: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    let items = items.as_array().ok_or("plan output is not an array")?;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i["strategy"] == "extend_tail"));
    Ok(())
}

#[test]
fn registry_commands_allocate_and_look_up() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path().to_string_lossy().to_string();

    let out = run_cli(&["registry", "--root", &root, "resolve", "A.SZ", "B.SH", "A.SZ"])?;
    assert_cli_success(&out);
    assert_eq!(stdout(&out), "1\tA.SZ\n2\tB.SH\n1\tA.SZ\n");

    let out = run_cli(&["registry", "--root", &root, "lookup", "2"])?;
    assert_cli_success(&out);
    assert_eq!(stdout(&out), "2\tB.SH\n");

    let out = run_cli(&["registry", "--root", &root, "list"])?;
    assert_cli_success(&out);
    assert_eq!(stdout(&out), "1\tA.SZ\n2\tB.SH\n");

    let out = run_cli(&["registry", "--root", &root, "lookup", "9"])?;
    assert!(!out.status.success());
    Ok(())
}

#[test]
fn init_config_refuses_to_overwrite() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path().to_string_lossy().to_string();

    let out = run_cli(&["init-config", "--root", &root])?;
    assert_cli_success(&out);
    let text = std::fs::read_to_string(tmp.path().join("tickstore.json"))?;
    let config: serde_json::Value = serde_json::from_str(&text)?;
    assert!(config["data_types"]["daily"].is_object());

    let out = run_cli(&["init-config", "--root", &root])?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Refusing to overwrite"));

    let out = run_cli(&["init-config", "--root", &root, "--force"])?;
    assert_cli_success(&out);

    let out = run_cli(&["data-types", "--root", &root])?;
    assert_cli_success(&out);
    let listing = stdout(&out);
    assert!(listing.starts_with("trade_cal"));
    assert!(listing.contains("daily"));
    Ok(())
}

#[test]
fn ingest_reports_rejected_rows() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path().join("store");
    let root_str = root.to_string_lossy().to_string();
    let input = tmp.path().join("bad.parquet");
    write_daily_parquet(&input, &[("A", "20230103", 1.0), ("A", "garbage", 2.0)])?;
    let input_str = input.to_string_lossy().to_string();

    let out = run_cli(&[
        "ingest",
        "--root",
        &root_str,
        "--data-type",
        "daily",
        "--parquet",
        &input_str,
    ])?;
    assert!(!out.status.success());
    assert!(stdout(&out).contains("unassigned: 1 rows not written"));
    assert!(root.join("daily/year=2023/data.parquet").exists());
    Ok(())
}
