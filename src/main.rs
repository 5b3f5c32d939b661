use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use rcn_matcher::{spawn_run, MatchConfig, OutputFormat, ProgressHandle, ReferenceNetwork};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Geojson,
    Fgb,
}

impl From<Format> for OutputFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Geojson => OutputFormat::GeoJson,
            Format::Fgb => OutputFormat::FlatGeobuf,
        }
    }
}

/// Match GPX tracks against the cycle-node network.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Zip archive or directory holding .gpx / .gpx.gz files
    input: PathBuf,

    /// Network segments (GeoJSON)
    #[arg(long)]
    segments: PathBuf,

    /// Network nodes (GeoJSON)
    #[arg(long)]
    nodes: PathBuf,

    /// Directory for the result tables and matched_results.zip
    #[arg(short, long, default_value = "data/out")]
    output: PathBuf,

    /// TOML file with matching settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Minimum share of a segment that must lie inside the corridor
    #[arg(long)]
    threshold: Option<f64>,

    /// Corridor radius in metres
    #[arg(long)]
    buffer: Option<f64>,

    /// Simplification tolerance in metres
    #[arg(long)]
    simplify: Option<f64>,

    /// Never parse in parallel
    #[arg(long)]
    sequential: bool,

    #[arg(long)]
    max_workers: Option<usize>,

    #[arg(long, value_enum)]
    format: Option<Format>,
}

impl Cli {
    fn load_config(&self) -> Result<MatchConfig> {
        let mut config = match &self.config {
            Some(path) => MatchConfig::from_toml_file(path)?,
            None => MatchConfig::default(),
        };
        config.apply_env()?;

        if let Some(threshold) = self.threshold {
            config.intersect_threshold = threshold;
        }
        if let Some(buffer) = self.buffer {
            config.buffer_distance = buffer;
        }
        if let Some(simplify) = self.simplify {
            config.simplify_tolerance = simplify;
        }
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }
        if let Some(format) = self.format {
            config.output_format = format.into();
        }
        config.constrained_mode |= self.sequential;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    println!("Loading reference network...");
    let network = ReferenceNetwork::load(&cli.segments, &cli.nodes, &config)
        .context("loading the reference network")?;
    println!(
        "✓ Loaded {} segments and {} nodes",
        network.segments.len(),
        network.nodes.len()
    );

    let working_epsg = config.working_epsg;
    let progress = ProgressHandle::new();
    let handle = spawn_run(
        config,
        Arc::new(network),
        progress.clone(),
        cli.input.clone(),
        cli.output.clone(),
    )?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")?
            .progress_chars("##-"),
    );
    loop {
        let view = progress.poll();
        bar.set_position(u64::from(view.percent));
        bar.set_message(view.step);
        if !view.running {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    bar.finish();

    let summary = match handle.join() {
        Ok(result) => result,
        Err(_) => anyhow::bail!("matching thread panicked"),
    };
    let summary = match summary {
        Ok(summary) => summary,
        Err(e) => {
            println!("✗ Processing {} failed: {}", cli.input.display(), e);
            return Err(e.into());
        }
    };

    println!("\n--- Summary ---");
    let report = &summary.report;
    println!(
        "Files: {} total, {} with tracks, {} without tracks, {} failed",
        report.files_total,
        report.files_contributing,
        report.files_without_tracks(),
        report.files_failed.len()
    );
    if report.points_unprojectable > 0 {
        println!(
            "✗ {} points outside EPSG:{} dropped, {} tracks lost entirely",
            report.points_unprojectable, working_epsg, report.tracks_unprojectable
        );
    }
    for failure in &report.files_failed {
        println!("✗ {}: {}", failure.file, failure.reason);
    }
    if let Some(reason) = &summary.empty_reason {
        println!("{}", reason);
    }
    println!(
        "✓ {} tracks, {} matched segments, {} matched nodes",
        summary.tracks, summary.matched_segments, summary.matched_nodes
    );
    println!("✓ Results written to {}", summary.archive.display());

    Ok(())
}
