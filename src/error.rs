//! Error types for the matching engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed XML in {file}: {reason}")]
    Xml { file: String, reason: String },

    #[error("{file} is not a GPX document (root element <{root}>)")]
    NotGpx { file: String, root: String },

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to set up projection from {from} to {to}: {reason}")]
    ProjectionSetup {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Projection failed: {0}")]
    Projection(#[from] proj::ProjError),

    #[error("({x}, {y}) lies outside the domain of EPSG:{epsg}")]
    OutsideProjection { x: f64, y: f64, epsg: i32 },

    #[error("Geometry operation failed: {0}")]
    Geometry(#[from] geos::Error),

    #[error("Unexpected geometry: {0}")]
    UnexpectedGeometry(String),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid reference network feature {index} in {path}: {reason}")]
    InvalidNetwork {
        path: PathBuf,
        index: usize,
        reason: String,
    },

    #[error("Invalid configuration value for {key}: {reason}")]
    ConfigInvalid { key: String, reason: String },

    #[error("Failed to parse configuration file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Export to {path} failed: {reason}")]
    Export { path: PathBuf, reason: String },

    #[error("A matching run is already in progress")]
    RunInProgress,

    #[error("Failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),
}

pub type Result<T> = std::result::Result<T, MatchError>;
