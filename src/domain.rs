use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// A calendar month, stored as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth(NaiveDate);

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, PipelineError> {
        if !(1..=9999).contains(&year) {
            return Err(PipelineError::InvalidRange(format!(
                "year {year} is out of range"
            )));
        }
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .ok_or_else(|| PipelineError::InvalidRange(format!("month {month} is out of range")))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn last_day(&self) -> NaiveDate {
        self.0.with_day(self.day_count()).unwrap_or(self.0)
    }

    pub fn day_count(&self) -> u32 {
        days_in_month(self.year(), self.month())
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for YearMonth {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let invalid = || PipelineError::InvalidRange(format!("'{value}' is not YYYY-MM"));
        let (year, month) = trimmed.split_once('-').ok_or_else(invalid)?;
        let well_formed = year.len() == 4
            && month.len() == 2
            && year.chars().all(|ch| ch.is_ascii_digit())
            && month.chars().all(|ch| ch.is_ascii_digit());
        if !well_formed {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        YearMonth::new(year, month)
    }
}

/// Length of a month, or 0 for an invalid one.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return 0;
    };
    first
        .checked_add_months(Months::new(1))
        .map(|next| (next - first).num_days() as u32)
        .unwrap_or(31)
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    #[value(name = "t_max")]
    TMax,
    #[value(name = "t_min")]
    TMin,
    #[value(name = "sol_rad")]
    SRad,
    #[value(name = "prec")]
    Prec,
}

impl Variable {
    pub const ALL: [Variable; 4] = [
        Variable::TMax,
        Variable::TMin,
        Variable::SRad,
        Variable::Prec,
    ];

    /// Output directory, catalog layer and filename prefix.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Variable::TMax => "TMAX",
            Variable::TMin => "TMIN",
            Variable::SRad => "SRAD",
            Variable::Prec => "PREC",
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            Variable::TMax => "t_max",
            Variable::TMin => "t_min",
            Variable::SRad => "sol_rad",
            Variable::Prec => "prec",
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Raw,
    Normalized,
    Clipped,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Raw => write!(f, "raw"),
            Stage::Normalized => write!(f, "normalized"),
            Stage::Clipped => write!(f, "clipped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum UnitTransform {
    None,
    Subtract(f64),
    Divide(f64),
}

impl UnitTransform {
    pub fn apply(&self, value: f32) -> f32 {
        match *self {
            UnitTransform::None => value,
            UnitTransform::Subtract(constant) => (f64::from(value) - constant) as f32,
            UnitTransform::Divide(constant) => (f64::from(value) / constant) as f32,
        }
    }
}

pub const KELVIN_OFFSET: f64 = 273.15;
pub const FLUX_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Archive {
    Chirps,
    AgEra5,
}

const AGERA5_INFIX: &str = "_C3S-glob-agric_AgERA5_";
const AGERA5_SUFFIX: &str = "_final-v1.1.nc";
const CHIRPS_PREFIX: &str = "chirps-v2.0.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableSpec {
    pub variable: Variable,
    pub archive: Archive,
    /// Variable name understood by the archive's retrieval API.
    pub source_name: &'static str,
    pub statistic: Option<&'static str>,
    /// Prefix of the archive's per-day file names.
    pub archive_name: &'static str,
    pub unit_transform: UnitTransform,
    pub output_prefix: &'static str,
}

impl VariableSpec {
    pub fn stages(&self) -> &'static [Stage] {
        match self.archive {
            Archive::Chirps => &[Stage::Raw, Stage::Clipped],
            Archive::AgEra5 => &[Stage::Raw, Stage::Normalized, Stage::Clipped],
        }
    }

    pub fn has_stage(&self, stage: Stage) -> bool {
        self.stages().contains(&stage)
    }

    /// The stage whose artifact feeds the clipper.
    pub fn clip_input_stage(&self) -> Stage {
        match self.archive {
            Archive::Chirps => Stage::Raw,
            Archive::AgEra5 => Stage::Normalized,
        }
    }

    /// Expected file name for one day at one stage, `None` when the stage does not apply.
    pub fn file_name(&self, stage: Stage, date: NaiveDate) -> Option<String> {
        if !self.has_stage(stage) {
            return None;
        }
        let compact = date.format("%Y%m%d");
        let name = match (stage, self.archive) {
            (Stage::Raw, Archive::Chirps) => {
                format!("{CHIRPS_PREFIX}{}.tif", date.format("%Y.%m.%d"))
            }
            (Stage::Raw, Archive::AgEra5) => {
                format!("{}{AGERA5_INFIX}{compact}{AGERA5_SUFFIX}", self.archive_name)
            }
            (Stage::Normalized, _) | (Stage::Clipped, _) => {
                format!("{}_{compact}.tif", self.output_prefix)
            }
        };
        Some(name)
    }

    /// Prefix the clipper strips from its input file name.
    pub fn clip_source_prefix(&self) -> String {
        match self.archive {
            Archive::Chirps => CHIRPS_PREFIX.to_string(),
            Archive::AgEra5 => format!("{}_", self.output_prefix),
        }
    }

    pub fn clip_output_prefix(&self) -> String {
        format!("{}_", self.output_prefix)
    }
}

/// Immutable per-variable lookup, built once and passed to every component.
#[derive(Debug, Clone)]
pub struct VariableTable {
    specs: BTreeMap<Variable, VariableSpec>,
}

impl VariableTable {
    pub fn standard() -> Self {
        let specs = [
            VariableSpec {
                variable: Variable::TMax,
                archive: Archive::AgEra5,
                source_name: "2m_temperature",
                statistic: Some("24_hour_maximum"),
                archive_name: "Temperature-Air-2m-Max-24h",
                unit_transform: UnitTransform::Subtract(KELVIN_OFFSET),
                output_prefix: "TMAX",
            },
            VariableSpec {
                variable: Variable::TMin,
                archive: Archive::AgEra5,
                source_name: "2m_temperature",
                statistic: Some("24_hour_minimum"),
                archive_name: "Temperature-Air-2m-Min-24h",
                unit_transform: UnitTransform::Subtract(KELVIN_OFFSET),
                output_prefix: "TMIN",
            },
            VariableSpec {
                variable: Variable::SRad,
                archive: Archive::AgEra5,
                source_name: "solar_radiation_flux",
                statistic: None,
                archive_name: "Solar-Radiation-Flux",
                unit_transform: UnitTransform::Divide(FLUX_SCALE),
                output_prefix: "SRAD",
            },
            VariableSpec {
                variable: Variable::Prec,
                archive: Archive::Chirps,
                source_name: "precipitation",
                statistic: None,
                archive_name: "chirps-v2.0",
                unit_transform: UnitTransform::None,
                output_prefix: "PREC",
            },
        ];
        Self {
            specs: specs.into_iter().map(|spec| (spec.variable, spec)).collect(),
        }
    }

    pub fn get(&self, variable: Variable) -> &VariableSpec {
        // standard() covers every Variable
        &self.specs[&variable]
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableSpec> {
        self.specs.values()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SamplePoint {
    pub id: String,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "long")]
    pub longitude: f64,
}
