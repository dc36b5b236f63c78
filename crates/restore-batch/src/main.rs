//! restore-batch: restore a batch of upscaled comic pages.
//!
//! Every (source, upscaled, destination) triple runs through the staged
//! pipeline: prefilter, smooth, trace, composite. Each phase has its own
//! worker pool, and all pages finish a phase before any page starts the
//! next. Failures are contained per page and summarized at the end.
//!
//! # Usage
//!
//! ```text
//! restore-batch --work-dir /tmp/work --manifest pages.json
//! restore-batch --work-dir /tmp/work --srce-dir scans --upscayl-dir upscayled --dest-dir restored
//! ```
//!
//! The exit code is 1 when any page failed or could not be set up.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{ArgGroup, Parser};
use restore_engines::{EngineConfig, RestoreEngine};
use restore_pipeline::{
    BatchEntry, BatchReport, JobSettings, Phase, RestoreConfig, Scheduler, StageEngine, batch,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Restore batches of upscaled comic page scans.
///
/// Inputs come either from a JSON manifest or from three directories
/// whose files are paired by stem.
#[derive(Parser, Debug)]
#[command(name = "restore-batch", version)]
#[command(group(ArgGroup::new("input").required(true).args(["manifest", "srce_dir"])))]
struct Cli {
    /// Scratch directory for intermediate artifacts. Created if missing.
    #[arg(long)]
    work_dir: PathBuf,

    /// JSON array of `{"srce", "upscayl", "dest"}` objects.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Directory of original scans.
    #[arg(long, requires_all = ["upscayl_dir", "dest_dir"])]
    srce_dir: Option<PathBuf>,

    /// Directory of upscaled scans, one per source with the same stem.
    #[arg(long)]
    upscayl_dir: Option<PathBuf>,

    /// Directory for restored pages, written as `<stem>.png`.
    #[arg(long)]
    dest_dir: Option<PathBuf>,

    /// Batch configuration as a JSON file. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Upscale factor of the inputs.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    scale: Option<u32>,

    /// Workers for the prefilter phase.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    prefilter_workers: Option<usize>,

    /// Workers for the smoothing phase (default sized by system memory).
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    smooth_workers: Option<usize>,

    /// Workers for the trace phase.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    trace_workers: Option<usize>,

    /// Workers for the composite phase.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    composite_workers: Option<usize>,

    /// Give up on a single stage after this many seconds.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<u64>::new().range(1..))]
    stage_timeout_secs: Option<u64>,

    /// Print the batch report as JSON instead of a summary.
    #[arg(long)]
    json: bool,

    /// More logging (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Everything a batch run is configured by, as read from `--config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct BatchConfig {
    /// Scheduling and pipeline settings.
    #[serde(flatten)]
    restore: RestoreConfig,

    /// Stage tunables and tool locations.
    engine: EngineConfig,
}

// ──────────────────────────────── Config ─────────────────────────────

fn load_config(path: Option<&Path>) -> anyhow::Result<BatchConfig> {
    let Some(path) = path else {
        return Ok(BatchConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config \"{}\"", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config \"{}\"", path.display()))
}

/// Apply command-line overrides on top of the file config.
fn apply_overrides(cli: &Cli, config: &mut BatchConfig) {
    let restore = &mut config.restore;
    if let Some(scale) = cli.scale {
        restore.scale = scale;
    }
    if let Some(secs) = cli.stage_timeout_secs {
        restore.stage_timeout = Some(Duration::from_secs(secs));
    }

    let overrides = [
        (Phase::Prefilter, cli.prefilter_workers),
        (Phase::Smooth, cli.smooth_workers),
        (Phase::Trace, cli.trace_workers),
        (Phase::Composite, cli.composite_workers),
    ];
    if overrides.iter().any(|(_, w)| w.is_some()) {
        let mut policy = restore.phase_policy();
        for (phase, workers) in overrides {
            if let Some(w) = workers {
                policy = policy.with_workers(phase, w);
            }
        }
        restore.phase_workers = Some(policy);
    }
}

// ──────────────────────────────── Inputs ─────────────────────────────

fn read_manifest(path: &Path) -> anyhow::Result<Vec<BatchEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest \"{}\"", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing manifest \"{}\"", path.display()))
}

/// Regular files of `dir`, sorted by name.
fn list_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("listing \"{}\"", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Pair every file of `srce_dir` with the file of the same stem in
/// `upscayl_dir`. A source without an upscaled partner still yields an
/// entry, pointing at `<stem>.png`, so that it is reported as a setup
/// failure rather than silently dropped.
fn pair_directories(
    srce_dir: &Path,
    upscayl_dir: &Path,
    dest_dir: &Path,
) -> anyhow::Result<Vec<BatchEntry>> {
    let upscayled: HashMap<OsString, PathBuf> = list_files(upscayl_dir)?
        .into_iter()
        .filter_map(|p| Some((p.file_stem()?.to_os_string(), p)))
        .collect();

    let mut entries = Vec::new();
    for srce in list_files(srce_dir)? {
        let Some(stem) = srce.file_stem() else {
            continue;
        };
        let mut png_name = stem.to_os_string();
        png_name.push(".png");
        let upscayl = upscayled
            .get(stem)
            .cloned()
            .unwrap_or_else(|| upscayl_dir.join(&png_name));
        entries.push(BatchEntry {
            dest: dest_dir.join(&png_name),
            srce,
            upscayl,
        });
    }
    Ok(entries)
}

fn collect_entries(cli: &Cli) -> anyhow::Result<Vec<BatchEntry>> {
    if let Some(manifest) = &cli.manifest {
        return read_manifest(manifest);
    }
    match (&cli.srce_dir, &cli.upscayl_dir, &cli.dest_dir) {
        (Some(srce), Some(upscayl), Some(dest)) => {
            std::fs::create_dir_all(dest)
                .with_context(|| format!("creating \"{}\"", dest.display()))?;
            pair_directories(srce, upscayl, dest)
        }
        _ => bail!("--srce-dir requires --upscayl-dir and --dest-dir"),
    }
}

// ──────────────────────────────── Run ────────────────────────────────

fn init_tracing(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<BatchReport> {
    let mut config = load_config(cli.config.as_deref())?;
    apply_overrides(cli, &mut config);
    config.restore.validate()?;
    config.engine.validate()?;

    std::fs::create_dir_all(&cli.work_dir)
        .with_context(|| format!("creating \"{}\"", cli.work_dir.display()))?;
    let entries = collect_entries(cli)?;
    tracing::info!(pages = entries.len(), work_dir = %cli.work_dir.display(), "batch inputs");

    let policy = config.restore.phase_policy();
    tracing::info!(%policy, scale = config.restore.scale, "phase workers");

    let engine: Arc<dyn StageEngine> = Arc::new(RestoreEngine::new(config.engine));
    let settings = JobSettings::new(&cli.work_dir, &config.restore, engine);
    let mut plan = batch::plan(entries, &settings);
    let scheduler = Scheduler::new(policy);
    Ok(batch::run(&mut plan, &scheduler)?)
}

fn print_summary(report: &BatchReport) {
    println!(
        "Restored {} of {} pages in {:.1}s ({} skipped, {} not started)",
        report.jobs.len() - report.failed_count(),
        report.jobs.len(),
        report.elapsed.as_secs_f64(),
        report.skipped.len(),
        report.setup_failures.len(),
    );
    for job in report.failed_jobs() {
        println!("FAILED {}", job.upscayl_file.display());
        for failure in &job.failures {
            println!("    {}: {}", failure.stage, failure.detail);
        }
    }
    for failure in &report.setup_failures {
        println!("NOT STARTED {}: {}", failure.entry.upscayl.display(), failure.reason);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let report = match run(&cli) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing report: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_summary(&report);
    }

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use restore_pipeline::PhasePolicy;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("restore-batch").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn input_source_is_required() {
        assert!(Cli::try_parse_from(["restore-batch", "--work-dir", "w"]).is_err());
    }

    #[test]
    fn srce_dir_needs_its_partners() {
        let result = Cli::try_parse_from([
            "restore-batch",
            "--work-dir",
            "w",
            "--srce-dir",
            "s",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_workers_rejected_by_parser() {
        let result = Cli::try_parse_from([
            "restore-batch",
            "--work-dir",
            "w",
            "--manifest",
            "m.json",
            "--smooth-workers",
            "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn flags_override_file_config() {
        let cli = parse(&[
            "--work-dir",
            "w",
            "--manifest",
            "m.json",
            "--scale",
            "2",
            "--stage-timeout-secs",
            "90",
            "--smooth-workers",
            "2",
        ]);
        let mut config = BatchConfig {
            restore: RestoreConfig {
                phase_workers: Some(PhasePolicy::uniform(5)),
                ..RestoreConfig::default()
            },
            ..BatchConfig::default()
        };
        apply_overrides(&cli, &mut config);

        assert_eq!(config.restore.scale, 2);
        assert_eq!(config.restore.stage_timeout, Some(Duration::from_secs(90)));
        let policy = config.restore.phase_workers.unwrap();
        assert_eq!(policy.workers(Phase::Prefilter), 5);
        assert_eq!(policy.workers(Phase::Smooth), 2);
        assert_eq!(policy.workers(Phase::Composite), 5);
    }

    #[test]
    fn no_worker_flags_keep_memory_detection() {
        let cli = parse(&["--work-dir", "w", "--manifest", "m.json"]);
        let mut config = BatchConfig::default();
        apply_overrides(&cli, &mut config);
        assert_eq!(config.restore.phase_workers, None);
    }

    #[test]
    fn config_file_is_flat_with_engine_section() {
        let json = r#"{
            "scale": 3,
            "engine": { "gmic": "/opt/gmic/bin/gmic", "posterize_levels": 6 }
        }"#;
        let config: BatchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.restore.scale, 3);
        assert_eq!(config.engine.gmic, "/opt/gmic/bin/gmic");
        assert_eq!(config.engine.posterize_levels, 6);
        assert_eq!(config.engine.vtracer, EngineConfig::default().vtracer);
    }

    #[test]
    fn directories_pair_by_stem() {
        let tmp = tempfile::tempdir().unwrap();
        let (srce, upscayl, dest) = (
            tmp.path().join("srce"),
            tmp.path().join("upscayl"),
            tmp.path().join("dest"),
        );
        for dir in [&srce, &upscayl] {
            std::fs::create_dir(dir).unwrap();
        }
        std::fs::write(srce.join("02.jpg"), b"").unwrap();
        std::fs::write(srce.join("01.jpg"), b"").unwrap();
        std::fs::write(upscayl.join("01.png"), b"").unwrap();
        std::fs::write(upscayl.join("02.png"), b"").unwrap();

        let entries = pair_directories(&srce, &upscayl, &dest).unwrap();
        assert_eq!(
            entries,
            vec![
                BatchEntry {
                    srce: srce.join("01.jpg"),
                    upscayl: upscayl.join("01.png"),
                    dest: dest.join("01.png"),
                },
                BatchEntry {
                    srce: srce.join("02.jpg"),
                    upscayl: upscayl.join("02.png"),
                    dest: dest.join("02.png"),
                },
            ]
        );
    }

    #[test]
    fn unpaired_source_still_yields_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let (srce, upscayl) = (tmp.path().join("srce"), tmp.path().join("upscayl"));
        std::fs::create_dir(&srce).unwrap();
        std::fs::create_dir(&upscayl).unwrap();
        std::fs::write(srce.join("09.jpg"), b"").unwrap();

        let entries = pair_directories(&srce, &upscayl, tmp.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].upscayl, upscayl.join("09.png"));
        assert!(!entries[0].upscayl.exists());
    }

    #[test]
    fn manifest_lists_triples() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pages.json");
        std::fs::write(
            &path,
            r#"[{"srce": "a.jpg", "upscayl": "a-x4.png", "dest": "out/a.png"}]"#,
        )
        .unwrap();
        let entries = read_manifest(&path).unwrap();
        assert_eq!(entries[0].dest, PathBuf::from("out/a.png"));
    }
}
