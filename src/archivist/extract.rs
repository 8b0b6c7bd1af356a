//! Per-stage sidecar readers. Each reader looks next to a stage output (or in the
//! stage working directory) for the auxiliary file its stage writes, and returns a
//! flat map of results. A missing or unreadable sidecar yields the declared field
//! names with null values.

use crate::archivist::config::StageKind;
use crate::archivist::ledger::StagePosition;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const IMPORT_FIELDS: &[&str] = &["stage_x", "stage_y", "defocus", "dose"];
const MOTION_FIELDS: &[&str] = &["frames", "total_drift", "mean_frame_drift"];
const CTF_FIELDS: &[&str] = &[
    "defocus_u",
    "defocus_v",
    "astigmatism_angle",
    "phase_shift",
    "cross_correlation",
    "resolution_limit",
];
const CLASSIFICATION_FIELDS: &[&str] = &["class_count", "particle_count"];

static POSITION_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Position>(.*?)</Position>").expect("static regex"));
static POSITION_X: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<X>\s*([^<\s]+)\s*</X>").expect("static regex"));
static POSITION_Y: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Y>\s*([^<\s]+)\s*</Y>").expect("static regex"));
static KEYED_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:\w+:)?Key>\s*(AppliedDefocus|Dose)\s*</(?:\w+:)?Key>\s*<(?:\w+:)?Value[^>]*>\s*([^<\s]+)\s*<")
        .expect("static regex")
});

pub struct ExtractRequest<'a> {
    pub kind: StageKind,
    pub key: &'a str,
    pub output_path: &'a Path,
    pub working_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub metadata: BTreeMap<String, Value>,
    pub sidecar: Option<PathBuf>,
    pub position: Option<StagePosition>,
    pub outcome: ExtractionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Parsed,
    Missing,
    Unparsable(String),
}

fn null_fields(fields: &[&str]) -> BTreeMap<String, Value> {
    fields
        .iter()
        .map(|f| ((*f).to_string(), Value::Null))
        .collect()
}

fn declared_fields(kind: StageKind) -> &'static [&'static str] {
    match kind {
        StageKind::Import => IMPORT_FIELDS,
        StageKind::MotionCorrection => MOTION_FIELDS,
        StageKind::CtfEstimation => CTF_FIELDS,
        StageKind::Classification => CLASSIFICATION_FIELDS,
    }
}

fn sibling(path: &Path, file_name: String) -> PathBuf {
    path.parent()
        .map(|p| p.join(&file_name))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

fn candidates(req: &ExtractRequest<'_>) -> Vec<PathBuf> {
    let stem = stem(req.output_path);
    let mut out = match req.kind {
        StageKind::Import => vec![
            req.output_path.with_extension("xml"),
            sibling(req.output_path, format!("{}.xml", req.key)),
        ],
        StageKind::MotionCorrection => vec![
            req.output_path.with_extension("log"),
            sibling(req.output_path, format!("{stem}_Log.txt")),
        ],
        StageKind::CtfEstimation => vec![
            req.output_path.with_extension("txt"),
            sibling(req.output_path, format!("{stem}_ctf.txt")),
        ],
        StageKind::Classification => vec![req.output_path.with_extension("params")],
    };
    if let Some(dir) = req.working_dir {
        let name = match req.kind {
            StageKind::Import => format!("{}.xml", req.key),
            StageKind::MotionCorrection => format!("logs/{}.log", req.key),
            StageKind::CtfEstimation => format!("{}_ctf.txt", req.key),
            StageKind::Classification => format!("{}.params", req.key),
        };
        out.push(dir.join(name));
    }
    out.dedup();
    out
}

/// Reads the stage's sidecar if one is on disk right now. Never waits; the caller
/// decides how long a missing sidecar may stay missing.
pub fn extract(req: &ExtractRequest<'_>) -> Extraction {
    let fields = declared_fields(req.kind);
    let missing = || Extraction {
        metadata: null_fields(fields),
        sidecar: None,
        position: None,
        outcome: ExtractionOutcome::Missing,
    };

    let Some(sidecar) = candidates(req).into_iter().find(|p| p.is_file()) else {
        return missing();
    };
    // The file may vanish between the existence check and the read.
    let Ok(raw) = fs::read_to_string(&sidecar) else {
        return missing();
    };

    let parsed = match req.kind {
        StageKind::Import => parse_epu_xml(&raw),
        StageKind::MotionCorrection => parse_motion_log(&raw),
        StageKind::CtfEstimation => parse_ctf_report(&raw),
        StageKind::Classification => parse_param_dump(&raw),
    };

    match parsed {
        Ok(values) => {
            let mut metadata = null_fields(fields);
            metadata.extend(values);
            let position = match (
                metadata.get("stage_x").and_then(Value::as_f64),
                metadata.get("stage_y").and_then(Value::as_f64),
            ) {
                (Some(x), Some(y)) => Some(StagePosition { x, y }),
                _ => None,
            };
            Extraction {
                metadata,
                sidecar: Some(sidecar),
                position,
                outcome: ExtractionOutcome::Parsed,
            }
        }
        Err(reason) => Extraction {
            metadata: null_fields(fields),
            sidecar: Some(sidecar),
            position: None,
            outcome: ExtractionOutcome::Unparsable(reason),
        },
    }
}

fn number(raw: &str) -> Option<Value> {
    let v = raw.trim().parse::<f64>().ok()?;
    if !v.is_finite() {
        return None;
    }
    Some(json!(v))
}

fn parse_epu_xml(raw: &str) -> Result<BTreeMap<String, Value>, String> {
    let mut out = BTreeMap::new();
    if let Some(block) = POSITION_BLOCK.captures(raw).and_then(|c| c.get(1)) {
        let block = block.as_str();
        if let Some(x) = POSITION_X.captures(block).and_then(|c| number(&c[1])) {
            out.insert("stage_x".to_string(), x);
        }
        if let Some(y) = POSITION_Y.captures(block).and_then(|c| number(&c[1])) {
            out.insert("stage_y".to_string(), y);
        }
    }
    for caps in KEYED_VALUE.captures_iter(raw) {
        let field = match &caps[1] {
            "AppliedDefocus" => "defocus",
            _ => "dose",
        };
        if let Some(v) = number(&caps[2]) {
            out.insert(field.to_string(), v);
        }
    }
    if out.is_empty() {
        return Err("no recognised EPU fields".to_string());
    }
    Ok(out)
}

/// Frame shift table: `frame x_shift y_shift` per line, other lines ignored.
fn parse_motion_log(raw: &str) -> Result<BTreeMap<String, Value>, String> {
    let mut shifts = Vec::new();
    for line in raw.lines() {
        let cols = line.split_whitespace().collect::<Vec<_>>();
        if cols.len() < 3 || cols[0].parse::<u32>().is_err() {
            continue;
        }
        let (Ok(dx), Ok(dy)) = (cols[1].parse::<f64>(), cols[2].parse::<f64>()) else {
            continue;
        };
        shifts.push((dx, dy));
    }
    if shifts.is_empty() {
        return Err("no frame shifts found".to_string());
    }
    let total = shifts
        .windows(2)
        .map(|w| ((w[1].0 - w[0].0).powi(2) + (w[1].1 - w[0].1).powi(2)).sqrt())
        .sum::<f64>();
    let mean = if shifts.len() > 1 {
        total / (shifts.len() - 1) as f64
    } else {
        0.0
    };

    let mut out = BTreeMap::new();
    out.insert("frames".to_string(), json!(shifts.len()));
    out.insert("total_drift".to_string(), json!(total));
    out.insert("mean_frame_drift".to_string(), json!(mean));
    Ok(out)
}

/// CTFFIND-style report: `#` comments, then one row of numeric columns.
fn parse_ctf_report(raw: &str) -> Result<BTreeMap<String, Value>, String> {
    let row = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .find_map(|l| {
            let cols = l
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .ok()?;
            (cols.len() >= 7).then_some(cols)
        })
        .ok_or_else(|| "no numeric CTF row".to_string())?;

    let mut out = BTreeMap::new();
    for (field, value) in CTF_FIELDS.iter().zip(&row[1..]) {
        if value.is_finite() {
            out.insert((*field).to_string(), json!(value));
        }
    }
    Ok(out)
}

/// `key = value` parameter dump; numeric values are kept as numbers.
fn parse_param_dump(raw: &str) -> Result<BTreeMap<String, Value>, String> {
    let mut out = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        let v = v.trim();
        out.insert(
            k.to_string(),
            number(v).unwrap_or_else(|| Value::String(v.to_string())),
        );
    }
    if out.is_empty() {
        return Err("empty parameter dump".to_string());
    }
    Ok(out)
}
