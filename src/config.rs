//! Matching configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables, then whatever the caller (usually the CLI) sets
//! explicitly. Call [`MatchConfig::validate`] once all layers are applied.

use crate::error::{MatchError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

pub const EPSG_WGS84: i32 = 4326;
/// Belgian Lambert 2008, metric.
pub const EPSG_LAMBERT_2008: i32 = 3812;

/// Deployment flag set by the hosting platform; disables parallel parsing.
pub const ENV_CONSTRAINED: &str = "RENDER";
const ENV_PREFIX: &str = "RCN_MATCHER_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    GeoJson,
    FlatGeobuf,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::GeoJson => "geojson",
            OutputFormat::FlatGeobuf => "fgb",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Simplification tolerance in working CRS units; tracks are simplified
    /// at half this value.
    pub simplify_tolerance: f64,
    /// Corridor half-width around each track.
    pub buffer_distance: f64,
    /// Minimum fraction of a segment that must lie inside a corridor.
    pub intersect_threshold: f64,
    pub buffer_quadrant_segments: i32,
    pub parallel_min_files: usize,
    pub parallel_min_cores: usize,
    pub max_workers: usize,
    /// Resource-constrained deployment; forces sequential parsing.
    pub constrained_mode: bool,
    pub working_epsg: i32,
    /// CRS of the reference network files on disk.
    pub network_epsg: i32,
    pub output_format: OutputFormat,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            simplify_tolerance: 10.0,
            buffer_distance: 20.0,
            intersect_threshold: 0.75,
            buffer_quadrant_segments: 8,
            parallel_min_files: 200,
            parallel_min_cores: 2,
            max_workers: 8,
            constrained_mode: false,
            working_epsg: EPSG_LAMBERT_2008,
            network_epsg: EPSG_WGS84,
            output_format: OutputFormat::GeoJson,
        }
    }
}

impl MatchConfig {
    /// Load a TOML file on top of the defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| MatchError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `RENDER` and `RCN_MATCHER_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(env::vars())
    }

    fn apply_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if key == ENV_CONSTRAINED {
                if value == "true" {
                    self.constrained_mode = true;
                }
                continue;
            }
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "SIMPLIFY_TOLERANCE" => self.simplify_tolerance = parse_var(&key, &value)?,
                "BUFFER_DISTANCE" => self.buffer_distance = parse_var(&key, &value)?,
                "INTERSECT_THRESHOLD" => self.intersect_threshold = parse_var(&key, &value)?,
                "PARALLEL_MIN_FILES" => self.parallel_min_files = parse_var(&key, &value)?,
                "PARALLEL_MIN_CORES" => self.parallel_min_cores = parse_var(&key, &value)?,
                "MAX_WORKERS" => self.max_workers = parse_var(&key, &value)?,
                "CONSTRAINED_MODE" => self.constrained_mode = parse_var(&key, &value)?,
                _ => tracing::debug!("Ignoring unknown environment override {}", key),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.intersect_threshold) {
            return Err(invalid(
                "intersect_threshold",
                format!("{} is outside [0, 1]", self.intersect_threshold),
            ));
        }
        if !(self.buffer_distance > 0.0) {
            return Err(invalid(
                "buffer_distance",
                format!("{} must be positive", self.buffer_distance),
            ));
        }
        if !(self.simplify_tolerance >= 0.0) {
            return Err(invalid(
                "simplify_tolerance",
                format!("{} must not be negative", self.simplify_tolerance),
            ));
        }
        if self.buffer_quadrant_segments < 1 {
            return Err(invalid("buffer_quadrant_segments", "must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(invalid("max_workers", "must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("cannot parse '{}'", value)))
}

fn invalid(key: &str, reason: String) -> MatchError {
    MatchError::ConfigInvalid {
        key: key.to_string(),
        reason,
    }
}
