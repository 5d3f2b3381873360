use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use loom_phys::aggregate::{
    summarize_all, time_histogram, vm_turn_correlation_by_speed, ConditionSummary,
    HistogramOptions, TimeHistogram, VmTurnCorrelation,
};
use loom_phys::classify::{discover_codes, trial_code};
use loom_phys::flight::FlightValidator;
use loom_phys::segment::{
    drop_redundant, edge_candidates, first_difference, trial_bounds, SegmentDiagnostics,
};
use loom_phys::{
    condition_for_index, condition_labels, process_batch, BatchResult, BridgePolicy, Channel,
    ConditionCountPolicy, Params, RecordingInput, SubjectFailure, SubjectId, SubjectResult,
    Speed, TraceChannel, CONDITION_COUNT, SAMPLE_RATE_HZ,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Looming flight trial segmentation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Segment, classify and extract trials from channel CSV recordings
    Process(ProcessArgs),
    /// Report channel statistics and marker edges for recordings
    Inspect(InspectArgs),
    /// Print the condition label table
    Labels,
}

#[derive(Parser, Debug)]
struct ProcessArgs {
    /// Channel CSV files (one column per channel, header row of channel names)
    #[arg(value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Manifest CSV with columns file,group[,exclude]
    #[arg(long, value_hint = ValueHint::FilePath)]
    manifest: Option<PathBuf>,

    /// Group assigned to positional inputs
    #[arg(long, default_value = "")]
    group: String,

    /// JSON file of parameter overrides
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Treatment of wing dropout spans
    #[arg(long, value_enum)]
    bridge: Option<BridgeOpt>,

    /// Warn instead of failing when a subject does not show nine condition codes
    #[arg(long, action = ArgAction::SetTrue)]
    lenient_conditions: bool,

    /// Samples kept before each trial start
    #[arg(long)]
    pre_samples: Option<usize>,

    /// Samples kept after each trial stop
    #[arg(long)]
    post_samples: Option<usize>,

    /// Trial table CSV path (`-` for stdout)
    #[arg(short, long, default_value = "trials.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Long-format per-sample trace CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    traces: Option<PathBuf>,

    /// Per group and condition mean trace CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    summary: Option<PathBuf>,

    /// Channel averaged into the summary and histograms (lmr, lwa, rwa, vm, ystim)
    #[arg(long, default_value = "lmr", value_parser = parse_channel)]
    summary_channel: TraceChannel,

    /// Bundle-relative baseline window `start:end` subtracted before averaging
    #[arg(long)]
    baseline: Option<String>,

    /// Per group and condition correlation of voltage change with turn size
    #[arg(long, value_hint = ValueHint::FilePath)]
    correlation: Option<PathBuf>,

    /// Per group and condition time-resolved density of the summary channel
    #[arg(long, value_hint = ValueHint::FilePath)]
    histogram: Option<PathBuf>,

    /// JSON report of per-subject results and failures
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Channel CSV files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "inspect.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// JSON file of parameter overrides
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BridgeOpt {
    Keep,
    Nullify,
}

impl From<BridgeOpt> for BridgePolicy {
    fn from(value: BridgeOpt) -> Self {
        match value {
            BridgeOpt::Keep => BridgePolicy::Keep,
            BridgeOpt::Nullify => BridgePolicy::Nullify,
        }
    }
}

fn parse_channel(text: &str) -> Result<TraceChannel> {
    TraceChannel::from_name(text).ok_or_else(|| {
        let known: Vec<&str> = TraceChannel::ALL.iter().map(|c| c.name()).collect();
        anyhow!("unknown channel `{}` (expected one of {})", text, known.join(", "))
    })
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    file: PathBuf,
    #[serde(default)]
    group: String,
    #[serde(default)]
    exclude: String,
}

#[derive(Debug)]
struct Job {
    path: PathBuf,
    subject: SubjectId,
    exclude: Vec<usize>,
}

#[derive(Serialize)]
struct Report<'a> {
    params: &'a Params,
    subjects: &'a [SubjectResult],
    failures: &'a [SubjectFailure],
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Process(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
        Command::Labels => false,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Process(args) => handle_process(args),
        Command::Inspect(args) => handle_inspect(args),
        Command::Labels => handle_labels(),
    }
}

fn handle_process(args: ProcessArgs) -> Result<()> {
    let mut params = load_params(args.params.as_deref())?;
    if let Some(bridge) = args.bridge {
        params.bridge_policy = bridge.into();
    }
    if args.lenient_conditions {
        params.condition_policy = ConditionCountPolicy::Warn;
    }
    if let Some(pre) = args.pre_samples {
        params.pre_trial_samples = pre;
    }
    if let Some(post) = args.post_samples {
        params.post_trial_samples = post;
    }
    params.validate()?;

    let baseline = args.baseline.as_deref().map(parse_range).transpose()?;

    let mut jobs = Vec::new();
    if let Some(manifest) = args.manifest.as_ref() {
        jobs.extend(read_manifest(manifest)?);
    }
    for path in &args.inputs {
        jobs.push(Job {
            path: path.clone(),
            subject: SubjectId::new(args.group.clone(), subject_name(path)),
            exclude: Vec::new(),
        });
    }
    if jobs.is_empty() {
        return Err(anyhow!("no input files supplied"));
    }

    let t_parse = Instant::now();
    let inputs = jobs
        .into_par_iter()
        .map(|job| -> Result<RecordingInput> {
            let channels = read_channels(&job.path)?;
            Ok(RecordingInput {
                subject: job.subject,
                channels,
                exclude: job.exclude,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if args.profile || args.verbose {
        info!(
            "Parse stage: {:.1} ms ({} recordings)",
            t_parse.elapsed().as_secs_f64() * 1000.0,
            inputs.len()
        );
    }

    let t_compute = Instant::now();
    let batch = process_batch(inputs, &params)?;
    if args.profile || args.verbose {
        info!(
            "Compute stage: {:.1} ms ({} bundles)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            batch.traces.len()
        );
    }
    if batch.subjects.is_empty() {
        return Err(anyhow!(
            "no subject could be processed ({} failures)",
            batch.failures.len()
        ));
    }

    let t_write = Instant::now();
    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        write_trials(&batch.subjects, &mut csv::Writer::from_writer(stdout.lock()))?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        write_trials(&batch.subjects, &mut csv::Writer::from_writer(file))?;
        info!("Wrote trial table: {}", args.output.display());
    }

    if let Some(path) = args.traces.as_ref() {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        write_traces(&batch, &mut csv::Writer::from_writer(file))?;
        info!("Wrote traces: {}", path.display());
    }

    if let Some(path) = args.summary.as_ref() {
        let summaries = summarize_all(&batch.traces, args.summary_channel, baseline.as_ref());
        let pre = params.pre_trial_samples;
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        write_summary(&summaries, pre, &mut csv::Writer::from_writer(file))?;
        info!("Wrote {} condition summaries: {}", summaries.len(), path.display());
    }

    if let Some(path) = args.correlation.as_ref() {
        let mut correlations = Vec::new();
        for group in batch.traces.groups() {
            for speed in Speed::ALL {
                correlations.extend(vm_turn_correlation_by_speed(
                    &batch.traces,
                    Some(group.as_str()),
                    speed,
                ));
            }
        }
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        write_correlation(&correlations, &mut csv::Writer::from_writer(file))?;
        info!("Wrote {} correlations: {}", correlations.len(), path.display());
    }

    if let Some(path) = args.histogram.as_ref() {
        let mut options = HistogramOptions::default();
        if let Some(range) = baseline.as_ref() {
            options.baseline = range.clone();
        }
        let mut histograms = Vec::new();
        for group in batch.traces.groups() {
            for condition in batch.traces.conditions(Some(group.as_str())) {
                histograms.extend(time_histogram(
                    &batch.traces,
                    &group,
                    condition,
                    args.summary_channel,
                    &options,
                )?);
            }
        }
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        write_histogram(&histograms, &mut csv::Writer::from_writer(file))?;
        info!("Wrote {} histograms: {}", histograms.len(), path.display());
    }

    if let Some(path) = args.report.as_ref() {
        let report = Report {
            params: &params,
            subjects: &batch.subjects,
            failures: &batch.failures,
        };
        let text = serde_json::to_string_pretty(&report)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote report: {}", path.display());
    }
    if args.profile || args.verbose {
        info!(
            "Write stage: {:.1} ms",
            t_write.elapsed().as_secs_f64() * 1000.0
        );
    }

    info!(
        "Processed {} subjects ({} trials), {} excluded",
        batch.subjects.len(),
        batch.subjects.iter().map(|s| s.trials.len()).sum::<usize>(),
        batch.failures.len()
    );
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let params = load_params(args.params.as_deref())?;
    let mut report = String::new();

    for path in &args.inputs {
        let channels = read_channels(path)?;
        let n = channels.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        report.push_str(&format!("FILE: {}\n", path.display()));
        report.push_str(&format!(
            "  samples: {} ({:.1} s)\n",
            n,
            n as f64 / SAMPLE_RATE_HZ
        ));

        report.push_str("  channels:\n");
        for (name, values) in &channels {
            let known = if Channel::from_name(name).is_some() { "" } else { " (unused)" };
            report.push_str(&format!("    - {}{}: {}\n", name, known, describe(values)));
        }

        let marker = channels
            .iter()
            .find(|(name, _)| Channel::from_name(name) == Some(Channel::Marker))
            .map(|(_, v)| v.as_slice());
        let Some(marker) = marker else {
            report.push_str("  marker: missing\n\n");
            continue;
        };

        let diff = first_difference(marker);
        let (starts, stops) = edge_candidates(&diff, params.start_edge_v, params.stop_edge_v);
        report.push_str(&format!(
            "  edges: {} starts ({} after dedup), {} stops ({} after dedup)\n",
            starts.len(),
            drop_redundant(&starts, params.redundant_gap_samples).len(),
            stops.len(),
            drop_redundant(&stops, params.redundant_gap_samples).len()
        ));

        let mut diagnostics = SegmentDiagnostics::default();
        match trial_bounds(marker, &params, &mut diagnostics) {
            Ok(pairs) => {
                report.push_str(&format!(
                    "  trials: {} (leading stop dropped: {}, trailing start dropped: {})\n",
                    pairs.len(),
                    diagnostics.dropped_leading_stop,
                    diagnostics.dropped_trailing_start
                ));
                let codes = pairs
                    .iter()
                    .filter_map(|&(start, stop)| trial_code(marker, start, stop).ok())
                    .collect::<Vec<_>>();
                let catalogue = discover_codes(&codes);
                report.push_str(&format!(
                    "  codes: {} distinct (expected {}): {:?}\n",
                    catalogue.len(),
                    CONDITION_COUNT,
                    catalogue
                ));

                let tach = channels
                    .iter()
                    .find(|(name, _)| Channel::from_name(name) == Some(Channel::Tach))
                    .map(|(_, v)| v.as_slice());
                if let Some(tach) = tach.filter(|t| t.len() == marker.len()) {
                    let validator = FlightValidator::new(tach, &params);
                    let margin = params.flight_margin_samples;
                    let flying = pairs
                        .iter()
                        .filter(|&&(start, stop)| {
                            validator
                                .is_flying(start.saturating_sub(margin), (stop + margin).min(tach.len()))
                                .unwrap_or(false)
                        })
                        .count();
                    report.push_str(&format!("  flying trials: {}/{}\n", flying, pairs.len()));
                }
            }
            Err(err) => report.push_str(&format!("  trials: error: {}\n", err)),
        }
        report.push('\n');
    }

    if args.output.as_os_str() == "-" {
        io::stdout().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Inspection report written: {}", args.output.display());
    }
    Ok(())
}

fn handle_labels() -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "index\tdirection\tspeed\tl/v_ms\tlabel")?;
    for (index, label) in condition_labels().iter().enumerate() {
        if let Some(condition) = condition_for_index(index) {
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}",
                index,
                condition.direction.name(),
                condition.speed.name(),
                condition.speed.l_over_v_ms(),
                label
            )?;
        }
    }
    Ok(())
}

fn load_params(path: Option<&Path>) -> Result<Params> {
    let Some(path) = path else {
        return Ok(Params::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read params {}", path.display()))?;
    Params::from_json_str(&text).with_context(|| format!("invalid params in {}", path.display()))
}

/// Read a channel table: a header row of channel names, one row per sample. Empty
/// cells and `nan` read as NaN.
fn read_channels(path: &Path) -> Result<Vec<(String, Vec<f64>)>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];

    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("failed to read {}", path.display()))?;
        for (col, field) in record.iter().enumerate() {
            let value = parse_sample(field).with_context(|| {
                format!(
                    "{}: row {}, column '{}': invalid sample '{}'",
                    path.display(),
                    row + 2,
                    &headers[col],
                    field
                )
            })?;
            columns[col].push(value);
        }
    }

    Ok(headers.iter().map(str::to_string).zip(columns).collect())
}

fn parse_sample(field: &str) -> Result<f64> {
    if field.is_empty() || field.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    Ok(field.parse::<f64>()?)
}

fn read_manifest(path: &Path) -> Result<Vec<Job>> {
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open manifest {}", path.display()))?;
    let mut jobs = Vec::new();
    for row in reader.deserialize::<ManifestRow>() {
        let row = row.with_context(|| format!("invalid manifest row in {}", path.display()))?;
        let file = if row.file.is_absolute() {
            row.file
        } else {
            base.join(row.file)
        };
        let exclude = parse_exclusions(&row.exclude)
            .with_context(|| format!("invalid exclusions for {}", file.display()))?;
        jobs.push(Job {
            subject: SubjectId::new(row.group, subject_name(&file)),
            path: file,
            exclude,
        });
    }
    Ok(jobs)
}

fn subject_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Parse `a:b` into the half-open range `a..b`.
fn parse_range(input: &str) -> Result<Range<usize>> {
    let (start, end) = input
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid range '{}': expected start:end", input))?;
    let start: usize = start
        .trim()
        .parse()
        .with_context(|| format!("invalid range start in '{}'", input))?;
    let end: usize = end
        .trim()
        .parse()
        .with_context(|| format!("invalid range end in '{}'", input))?;
    if end <= start {
        return Err(anyhow!("range '{}' is empty", input));
    }
    Ok(start..end)
}

/// Expand `1000-2000;5000` into sample indices. Ranges are half-open.
fn parse_exclusions(input: &str) -> Result<Vec<usize>> {
    let mut out = Vec::new();
    for token in input.split(';') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.split_once('-') {
            Some((start, end)) => {
                let start: usize = start
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid exclusion '{}'", trimmed))?;
                let end: usize = end
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid exclusion '{}'", trimmed))?;
                if end < start {
                    return Err(anyhow!("exclusion '{}' ends before it starts", trimmed));
                }
                out.extend(start..end);
            }
            None => out.push(
                trimmed
                    .parse()
                    .with_context(|| format!("invalid exclusion '{}'", trimmed))?,
            ),
        }
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or(String::new(), |v| format!("{:.1}", v))
}

fn fmt_sample(value: f64) -> String {
    if value.is_finite() {
        format!("{:.4}", value)
    } else {
        String::new()
    }
}

fn describe(values: &[f64]) -> String {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return format!("count={}, finite=0", values.len());
    }
    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    format!(
        "count={}, finite={}, min={:.3}, max={:.3}, mean={:.3}",
        values.len(),
        finite.len(),
        min,
        max,
        mean
    )
}

fn write_trials<W: Write>(subjects: &[SubjectResult], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "group",
        "subject",
        "status",
        "trial",
        "start",
        "stop",
        "duration_s",
        "code",
        "condition",
        "label",
    ])?;
    for result in subjects {
        let status = match result.status {
            loom_phys::SubjectStatus::Ok => "ok",
            loom_phys::SubjectStatus::NoFlightTrials => "no_flight_trials",
        };
        if result.trials.is_empty() {
            writer.write_record([
                result.subject.group.as_str(),
                result.subject.name.as_str(),
                status,
                "",
                "",
                "",
                "",
                "",
                "",
                "",
            ])?;
            continue;
        }
        for trial in &result.trials {
            writer.write_record(&[
                result.subject.group.clone(),
                result.subject.name.clone(),
                status.to_string(),
                trial.index.to_string(),
                trial.start.to_string(),
                trial.stop.to_string(),
                format!("{:.4}", trial.duration_s()),
                fmt_opt(trial.code),
                trial.condition.map_or(String::new(), |c| c.to_string()),
                trial.label().unwrap_or_default().to_string(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_traces<W: Write>(batch: &BatchResult, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "group",
        "subject",
        "trial",
        "condition",
        "channel",
        "sample",
        "time_ms",
        "value",
    ])?;
    for bundle in batch.traces.bundles() {
        for (channel, values) in &bundle.traces {
            for (i, &value) in values.iter().enumerate() {
                writer.write_record(&[
                    bundle.subject.group.clone(),
                    bundle.subject.name.clone(),
                    bundle.trial.to_string(),
                    bundle.condition.to_string(),
                    channel.name().to_string(),
                    i.to_string(),
                    relative_ms(i, bundle.pre_samples),
                    fmt_sample(value),
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_summary<W: Write>(
    summaries: &[ConditionSummary],
    pre_samples: usize,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "group",
        "condition",
        "label",
        "channel",
        "n_subjects",
        "n_trials",
        "sample",
        "time_ms",
        "mean",
    ])?;
    for summary in summaries {
        for (i, &value) in summary.mean.iter().enumerate() {
            writer.write_record(&[
                summary.group.clone(),
                summary.condition.to_string(),
                summary.label.clone().unwrap_or_default(),
                summary.channel.name().to_string(),
                summary.n_subjects.to_string(),
                summary.n_trials.to_string(),
                i.to_string(),
                relative_ms(i, pre_samples),
                fmt_sample(value),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_correlation<W: Write>(
    correlations: &[VmTurnCorrelation],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record(["group", "condition", "label", "n_trials", "center_s", "n", "r", "p"])?;
    for corr in correlations {
        for point in &corr.points {
            writer.write_record(&[
                corr.group.clone().unwrap_or_default(),
                corr.condition.to_string(),
                corr.label.clone().unwrap_or_default(),
                corr.n_trials.to_string(),
                format!("{:.4}", point.center_s),
                point.n_trials.to_string(),
                format!("{:.6}", point.r),
                format!("{:.6e}", point.p),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// One row per bin, lower edges only.
fn write_histogram<W: Write>(histograms: &[TimeHistogram], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "group",
        "condition",
        "channel",
        "n_trials",
        "time_lo",
        "value_lo",
        "density",
    ])?;
    for hist in histograms {
        for ((ti, vi), &density) in hist.density.indexed_iter() {
            writer.write_record(&[
                hist.group.clone(),
                hist.condition.to_string(),
                hist.channel.name().to_string(),
                hist.n_trials.to_string(),
                fmt_sample(hist.time_edges[ti]),
                fmt_sample(hist.value_edges[vi]),
                format!("{:.6e}", density),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Time of bundle sample `i` relative to the trial start.
fn relative_ms(i: usize, pre_samples: usize) -> String {
    let ms = (i as f64 - pre_samples as f64) * 1000.0 / SAMPLE_RATE_HZ;
    format!("{:.1}", ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exclusions() {
        assert_eq!(parse_exclusions("").unwrap(), Vec::<usize>::new());
        assert_eq!(parse_exclusions("3-6; 1 ;4").unwrap(), vec![1, 3, 4, 5]);
        assert!(parse_exclusions("9-2").is_err());
        assert!(parse_exclusions("a-b").is_err());
    }

    #[test]
    fn test_parse_channel_accepts_trace_names() {
        assert_eq!(parse_channel("vm").unwrap(), TraceChannel::Vm);
        assert_eq!(parse_channel(" YStim ").unwrap(), TraceChannel::YStim);
        let err = parse_channel("tach").unwrap_err().to_string();
        assert!(err.contains("lmr, lwa, rwa, vm, ystim"), "{err}");
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("200:700").unwrap(), 200..700);
        assert!(parse_range("700:200").is_err());
        assert!(parse_range("200").is_err());
    }

    #[test]
    fn test_parse_sample_blank_is_nan() {
        assert!(parse_sample("").unwrap().is_nan());
        assert!(parse_sample("NaN").unwrap().is_nan());
        assert_eq!(parse_sample("-4.5").unwrap(), -4.5);
        assert!(parse_sample("x").is_err());
    }

    #[test]
    fn test_relative_ms() {
        assert_eq!(relative_ms(0, 25_000), "-2500.0");
        assert_eq!(relative_ms(25_010, 25_000), "1.0");
    }

    #[test]
    fn test_read_channels_and_manifest() {
        let dir = std::env::temp_dir().join(format!("loom_phys_cli_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let recording = dir.join("fly7.csv");
        fs::write(&recording, "x_ch,PATID,extra\n0.5,-5,\n1.5,,2\n").unwrap();
        let channels = read_channels(&recording).unwrap();
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0], ("x_ch".to_string(), vec![0.5, 1.5]));
        assert_eq!(channels[1].1[0], -5.0);
        assert!(channels[1].1[1].is_nan());

        let manifest = dir.join("manifest.csv");
        fs::write(&manifest, "file,group,exclude\nfly7.csv,wt,10-12\n").unwrap();
        let jobs = read_manifest(&manifest).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].path, recording);
        assert_eq!(jobs[0].subject, SubjectId::new("wt", "fly7"));
        assert_eq!(jobs[0].exclude, vec![10, 11]);

        let _ = fs::remove_dir_all(&dir);
    }
}
