//! Path grammars that turn instrument output files into canonical artifact identities.
//!
//! A monitor is configured with one acquisition mode; the grammars of that mode are
//! tried in order and the first structural match wins. Anything else resolves to
//! [`Resolution::NotAnArtifact`] so a stray file never aborts a poll tick.

use crate::archivist::config::AcquisitionMode;
use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeFormat {
    Hms,
    Hm,
}

#[derive(Debug, Clone, Copy)]
pub struct GrammarSpec {
    pub name: &'static str,
    pub mode: AcquisitionMode,
    pattern: &'static str,
    time_format: TimeFormat,
}

const GRAMMARS: &[GrammarSpec] = &[
    GrammarSpec {
        name: "epu-gridsquare",
        mode: AcquisitionMode::Mosaic,
        pattern: r"^(?P<root>.*)/(?P<batch>GridSquare_\d+)/Data/(?P<key>FoilHole_(?P<hole>\d+)_Data_(?P<area>\d+)_(?P<seq>\d+)_(?P<date>\d{8})_(?P<time>\d{6}))(?P<suffix>[-_][A-Za-z0-9_-]*)?\.(?:mrc|tif|tiff)$",
        time_format: TimeFormat::Hms,
    },
    GrammarSpec {
        name: "epu-legacy-gridsquare",
        mode: AcquisitionMode::Mosaic,
        pattern: r"^(?P<root>.*)/(?P<batch>GridSquare_\d+)/(?P<key>FoilHole_(?P<hole>\d+)_Data_(?P<area>\d+)_(?P<seq>\d+)_(?P<date>\d{8})_(?P<time>\d{4}))(?P<suffix>[-_][A-Za-z0-9_-]*)?\.mrc$",
        time_format: TimeFormat::Hm,
    },
    GrammarSpec {
        name: "epu-ungrouped",
        mode: AcquisitionMode::Mosaic,
        pattern: r"^(?P<root>.*?)/?(?P<key>FoilHole_(?P<hole>\d+)_Data_(?P<area>\d+)_(?P<seq>\d+)_(?P<date>\d{8})_(?P<time>\d{6}))(?P<suffix>[-_][A-Za-z0-9_-]*)?\.(?:mrc|tif|tiff|txt|log|params)$",
        time_format: TimeFormat::Hms,
    },
    GrammarSpec {
        name: "epu-fractions",
        mode: AcquisitionMode::TiledFractions,
        pattern: r"^(?P<root>.*)/(?P<batch>GridSquare_\d+)/Data/(?P<key>FoilHole_(?P<hole>\d+)_Data_(?P<area>\d+)_(?P<seq>\d+)_(?P<date>\d{8})_(?P<time>\d{6}))(?P<suffix>_[Ff]ractions(?:[-_][A-Za-z0-9_-]*)?)\.(?:tiff|tif|mrc|eer)$",
        time_format: TimeFormat::Hms,
    },
    GrammarSpec {
        name: "epu-fractions-ungrouped",
        mode: AcquisitionMode::TiledFractions,
        pattern: r"^(?P<root>.*?)/?(?P<key>FoilHole_(?P<hole>\d+)_Data_(?P<area>\d+)_(?P<seq>\d+)_(?P<date>\d{8})_(?P<time>\d{6}))(?P<suffix>[-_][A-Za-z0-9_-]*)?\.(?:tiff|tif|mrc|eer|txt|log|params)$",
        time_format: TimeFormat::Hms,
    },
    GrammarSpec {
        name: "tomo-series",
        mode: AcquisitionMode::TiltSeries,
        pattern: r"^(?P<root>.*?)/?(?P<key>(?P<batch>[A-Za-z][A-Za-z0-9]*_\d+)_(?P<seq>\d{3,})_(?P<angle>-?\d+\.\d+))(?:_(?P<date>\d{8})_(?P<time>\d{6}))?(?P<suffix>_[A-Za-z][A-Za-z0-9_]*)?\.(?:mrc|tif|tiff|eer|txt|log|params)$",
        time_format: TimeFormat::Hms,
    },
    GrammarSpec {
        name: "tomo-bracketed",
        mode: AcquisitionMode::TiltSeries,
        pattern: r"^(?P<root>.*?)/?(?P<key>(?P<batch>[A-Za-z][A-Za-z0-9]*_\d+)_(?P<seq>\d{3,})\[(?P<angle>-?\d+(?:\.\d+)?)\])(?P<suffix>_[A-Za-z][A-Za-z0-9_]*)?\.(?:mrc|tif|tiff|eer|txt|log|params)$",
        time_format: TimeFormat::Hms,
    },
];

/// Grammar specs for `mode`, optionally restricted to `only` by name.
pub fn grammars_for(mode: AcquisitionMode, only: &[String]) -> Vec<GrammarSpec> {
    GRAMMARS
        .iter()
        .filter(|g| g.mode == mode)
        .filter(|g| only.is_empty() || only.iter().any(|n| n == g.name))
        .copied()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactIdentity {
    pub key: String,
    pub batch_key: Option<String>,
    pub sequence: u64,
    pub acquired_at_epoch_secs: Option<u64>,
    pub suffix: Option<String>,
    pub grammar: String,
    pub tilt_angle: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Artifact(ArtifactIdentity),
    NotAnArtifact { key: String, reason: String },
}

struct CompiledGrammar {
    spec: GrammarSpec,
    regex: Regex,
}

pub struct Resolver {
    grammars: Vec<CompiledGrammar>,
    timezone: Tz,
    require_existing_files: bool,
}

impl Resolver {
    pub fn new(
        mode: AcquisitionMode,
        only: &[String],
        timezone: &str,
        require_existing_files: bool,
    ) -> Result<Self> {
        let specs = grammars_for(mode, only);
        if specs.is_empty() {
            return Err(anyhow!(
                "acquisition mode `{}` has no grammar rules",
                mode.as_str()
            ));
        }
        let timezone: Tz = timezone
            .parse()
            .map_err(|err| anyhow!("invalid acquisition timezone {timezone}: {err}"))?;
        let mut grammars = Vec::with_capacity(specs.len());
        for spec in specs {
            let regex = Regex::new(spec.pattern)
                .map_err(|err| anyhow!("grammar {} failed to compile: {err}", spec.name))?;
            grammars.push(CompiledGrammar { spec, regex });
        }
        Ok(Self {
            grammars,
            timezone,
            require_existing_files,
        })
    }

    pub fn grammar_names(&self) -> Vec<&'static str> {
        self.grammars.iter().map(|g| g.spec.name).collect()
    }

    pub fn resolve(&self, path: &Path) -> Resolution {
        let raw = path.to_string_lossy().replace('\\', "/");
        if self.require_existing_files && !path.exists() {
            return not_an_artifact(&raw, "missing-file");
        }

        for grammar in &self.grammars {
            let Some(caps) = grammar.regex.captures(&raw) else {
                continue;
            };
            return match self.identity_from(&grammar.spec, &caps) {
                Ok(identity) => Resolution::Artifact(identity),
                Err(reason) => not_an_artifact(&raw, reason),
            };
        }
        not_an_artifact(&raw, "no-grammar-matched")
    }

    fn identity_from(
        &self,
        spec: &GrammarSpec,
        caps: &Captures<'_>,
    ) -> std::result::Result<ArtifactIdentity, &'static str> {
        let key = caps.name("key").map(|m| m.as_str()).ok_or("missing-key")?;
        let sequence = caps
            .name("seq")
            .ok_or("missing-sequence")?
            .as_str()
            .parse::<u64>()
            .map_err(|_| "sequence-out-of-range")?;
        let tilt_angle = match caps.name("angle") {
            Some(m) => Some(m.as_str().parse::<f64>().map_err(|_| "invalid-angle")?),
            None => None,
        };
        let acquired_at_epoch_secs = match (caps.name("date"), caps.name("time")) {
            (Some(date), Some(time)) => Some(
                self.local_epoch(date.as_str(), time.as_str(), spec.time_format)
                    .ok_or("invalid-timestamp")?,
            ),
            _ => None,
        };
        let suffix = caps
            .name("suffix")
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty());

        Ok(ArtifactIdentity {
            key: key.to_string(),
            batch_key: caps.name("batch").map(|m| m.as_str().to_string()),
            sequence,
            acquired_at_epoch_secs,
            suffix,
            grammar: spec.name.to_string(),
            tilt_angle,
        })
    }

    fn local_epoch(&self, date: &str, time: &str, format: TimeFormat) -> Option<u64> {
        let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
        let time = match format {
            TimeFormat::Hms => NaiveTime::parse_from_str(time, "%H%M%S").ok()?,
            TimeFormat::Hm => NaiveTime::parse_from_str(time, "%H%M").ok()?,
        };
        let local = self
            .timezone
            .from_local_datetime(&NaiveDateTime::new(date, time))
            .earliest()?;
        u64::try_from(local.timestamp()).ok()
    }
}

fn not_an_artifact(raw: &str, reason: &str) -> Resolution {
    Resolution::NotAnArtifact {
        key: raw.to_string(),
        reason: reason.to_string(),
    }
}
