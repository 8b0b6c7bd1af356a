use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const KEY_A: &str = "FoilHole_11_Data_4_1_20240311_101530";
const KEY_B: &str = "FoilHole_12_Data_4_2_20240311_101612";

fn write_config(home: &Path, raw: &Path, ctf: &Path) {
    fs::create_dir_all(home).expect("mkdir home");
    let config = format!(
        r#"
[acquisition]
mode = "mosaic"
timezone = "UTC"

[batching]
quiescence_timeout_secs = 600

[archive]
backend = "catalog"
retry_delay_ms = 0

[session]
proposal = "bi23047-12"
instrument = "Krios-2"

[[stages]]
name = "import"
kind = "import"
output_dir = "{raw}"
extensions = ["tiff"]
archival = "batch-only"

[[stages]]
name = "ctf"
kind = "ctf-estimation"
output_dir = "{ctf}"
extensions = ["mrc"]
archival = "per-artifact"
"#,
        raw = raw.display(),
        ctf = ctf.display()
    );
    fs::write(home.join("archivist.toml"), config).expect("write config");
}

fn epu_xml(x: f64, y: f64) -> String {
    format!(
        "<MicroscopeImage><stage><Position><X>{x}</X><Y>{y}</Y><Z>0</Z></Position></stage>\
         <a:Key>Dose</a:Key><a:Value>48.5</a:Value></MicroscopeImage>"
    )
}

fn read_json(path: &Path) -> Value {
    let raw = fs::read_to_string(path).expect("read json");
    serde_json::from_str(&raw).expect("parse json")
}

#[test]
fn watch_once_on_finished_pipeline_archives_batch_and_stage_results() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path().join("home");
    let data = tmp.path().join("raw/GridSquare_3/Data");
    let ctf = tmp.path().join("proc/ctf");
    fs::create_dir_all(&data).expect("mkdir data");
    fs::create_dir_all(&ctf).expect("mkdir ctf");

    for (key, x) in [(KEY_A, 1.0e-4), (KEY_B, 3.0e-4)] {
        fs::write(data.join(format!("{key}.tiff")), "movie").expect("movie");
        fs::write(data.join(format!("{key}.xml")), epu_xml(x, 2.0e-4)).expect("xml");
    }
    fs::write(ctf.join(format!("{KEY_A}_ctf.mrc")), "spectrum").expect("ctf mrc");
    fs::write(
        ctf.join(format!("{KEY_A}_ctf.txt")),
        "# CTFFIND\n1.0 15000.0 14500.0 12.0 0.0 0.12 3.4\n",
    )
    .expect("ctf report");
    fs::write(tmp.path().join("raw/.finished"), "").expect("import finished");
    fs::write(ctf.join(".finished"), "").expect("ctf finished");
    write_config(&home, &tmp.path().join("raw"), &ctf);

    assert_cmd::cargo::cargo_bin_cmd!("cryo-archivist")
        .current_dir(tmp.path())
        .env("ARCHIVIST_HOME", &home)
        .env("ARCHIVIST_SIDECAR_WAIT_SECS", "0")
        .arg("watch")
        .arg("--once")
        .assert()
        .success()
        .stdout(predicate::str::contains("watch: ok"))
        .stdout(predicate::str::contains("flushed=GridSquare_3"))
        .stderr(predicate::str::contains("ARCHIVIST_TICK tick=1"));

    let ledger = read_json(&home.join("state/ledger.json"));
    assert_eq!(ledger["metadata"]["proposal"], "bi23047-12");
    let a = &ledger["artifacts"][KEY_A];
    assert_eq!(a["batch_key"], "GridSquare_3");
    assert_eq!(a["archived"], true);
    assert_eq!(a["stages"]["import"]["metadata"]["dose"], 48.5);
    assert!(
        a["stages"]["ctf"]["result_id"]
            .as_str()
            .is_some_and(|id| id.starts_with("catalog:"))
    );
    assert_eq!(a["stages"]["ctf"]["metadata"]["defocus_u"], 15000.0);
    let batch = &ledger["batches"]["GridSquare_3"];
    assert_eq!(batch["state"], "archived");
    assert!((batch["mean_position"]["x"].as_f64().expect("mean x") - 2.0e-4).abs() < 1e-12);

    let records = fs::read_dir(home.join("catalog"))
        .expect("catalog dir")
        .filter_map(|e| e.ok())
        .map(|e| read_json(&e.path()))
        .collect::<Vec<_>>();
    assert_eq!(records.len(), 2);
    let batch_record = records
        .iter()
        .find(|r| r["metadata"]["batch_key"] == "GridSquare_3" && r["metadata"]["stage"].is_null())
        .expect("batch record");
    assert_eq!(batch_record["metadata"]["instrument"], "Krios-2");
    assert_eq!(
        batch_record["rawLinks"],
        serde_json::json!([KEY_A, KEY_B])
    );

    let audit = fs::read_to_string(home.join("logs/audit.log")).expect("audit log");
    assert!(audit.contains("\"phase\":\"archive\""));
}

#[test]
fn repeated_watch_runs_do_not_duplicate_unrecognized_files_or_records() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path().join("home");
    let raw = tmp.path().join("raw");
    let data = raw.join("GridSquare_1/Data");
    let ctf = tmp.path().join("proc/ctf");
    fs::create_dir_all(&data).expect("mkdir");
    fs::create_dir_all(&ctf).expect("mkdir");
    fs::write(data.join(format!("{KEY_A}.tiff")), "movie").expect("movie");
    fs::write(data.join("gain_ref.tiff"), "gain").expect("gain");
    fs::write(raw.join(".finished"), "").expect("finished");
    fs::write(ctf.join(".finished"), "").expect("finished");
    write_config(&home, &raw, &ctf);

    for _ in 0..2 {
        assert_cmd::cargo::cargo_bin_cmd!("cryo-archivist")
            .current_dir(tmp.path())
            .env("ARCHIVIST_HOME", &home)
            .env("ARCHIVIST_SIDECAR_WAIT_SECS", "0")
            .args(["watch", "--once", "--json"])
            .assert()
            .success();
    }

    let ledger = read_json(&home.join("state/ledger.json"));
    let artifacts = ledger["artifacts"].as_object().expect("artifacts");
    assert_eq!(artifacts.len(), 2);
    let gain = artifacts
        .iter()
        .find(|(k, _)| k.ends_with("gain_ref.tiff"))
        .map(|(_, v)| v)
        .expect("gain entry");
    assert_eq!(gain["not_an_artifact"], true);

    let records = fs::read_dir(home.join("catalog")).expect("catalog").count();
    assert_eq!(records, 1);
}

#[test]
fn watch_rejects_both_mode_flags() {
    let tmp = tempdir().expect("tempdir");
    assert_cmd::cargo::cargo_bin_cmd!("cryo-archivist")
        .current_dir(tmp.path())
        .env("ARCHIVIST_HOME", tmp.path().join("home"))
        .args(["watch", "--once", "--daemon"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("use only one of --once or --daemon"));
}

#[test]
fn invalid_configuration_is_fatal_at_startup() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path().join("home");
    fs::create_dir_all(&home).expect("mkdir");
    fs::write(
        home.join("archivist.toml"),
        "[archive]\nbackend = \"s3\"\n",
    )
    .expect("config");

    assert_cmd::cargo::cargo_bin_cmd!("cryo-archivist")
        .current_dir(tmp.path())
        .env("ARCHIVIST_HOME", &home)
        .args(["watch", "--once"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid archive backend"));
    assert!(!home.join("state/ledger.json").exists());
}
