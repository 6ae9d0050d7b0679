use crate::collect::{select_events, Collector, RunMode, SamplingEvent};
use crate::config::{BenchmarkEntry, HarnessConfig, SideConfig};
use crate::descriptor::RunDescriptor;
use crate::process::ProcessRunner;
use crate::template::Environment;
use anyhow::{Context, Result};
use bench_analysis::{compare, summarize, ComparisonResult, ReducedStatistic, SampleSet, Unit};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SideReport {
    pub run_file: PathBuf,
    pub mode: RunMode,
    pub display_name: String,
    pub samples: SampleSet,
    pub statistic: ReducedStatistic,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub name: String,
    pub unit: Unit,
    pub baseline: SideReport,
    pub treatment: SideReport,
    pub comparison: ComparisonResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub created_at: String,
    pub iterations: usize,
    pub benchmarks: Vec<BenchmarkReport>,
    pub geomean: Option<f64>,
    /// Why `geomean` is absent.
    pub geomean_error: Option<String>,
}

impl SweepReport {
    /// Ratios fed to the summary. Non-finite ratios mark failed measurements
    /// and are passed as zero so the summary skips them.
    pub fn summary_inputs(&self) -> Vec<f64> {
        self.benchmarks
            .iter()
            .map(|b| b.comparison.ratio)
            .map(|r| if r.is_finite() { r } else { 0.0 })
            .collect()
    }
}

/// Runs the selected entries one after another. Every run file and the event
/// selection are validated before the first process is launched. Each
/// benchmark's result is an independent value; nothing is shared between
/// them except the read-only configuration and base environment.
pub fn run_sweep<F>(
    config: &HarnessConfig,
    entries: &[&BenchmarkEntry],
    base_env: &Environment,
    mut on_sample: F,
) -> Result<SweepReport>
where
    F: FnMut(&str, RunMode, usize, f64),
{
    let events = sweep_events(config, entries.iter().copied())?;
    let prepared = entries
        .iter()
        .map(|entry| PreparedBenchmark::new(config, entry, base_env))
        .collect::<Result<Vec<_>>>()?;
    debug!(benchmarks = prepared.len(), "sweep configuration validated");

    let mut benchmarks = Vec::with_capacity(prepared.len());
    for benchmark in &prepared {
        let report = benchmark.run(config, &events, base_env, &mut on_sample)?;
        info!(
            benchmark = %report.name,
            ratio = report.comparison.ratio,
            direction = %report.comparison.direction,
            "benchmark complete"
        );
        benchmarks.push(report);
    }

    let mut report = SweepReport {
        created_at: Utc::now().to_rfc3339(),
        iterations: config.iterations,
        benchmarks,
        geomean: None,
        geomean_error: None,
    };
    match summarize(&report.summary_inputs()) {
        Ok(g) => report.geomean = Some(g),
        Err(e) => {
            warn!(error = %e, "geometric mean unavailable");
            report.geomean_error = Some(e.to_string());
        }
    }
    Ok(report)
}

pub fn run_benchmark<F>(
    config: &HarnessConfig,
    entry: &BenchmarkEntry,
    base_env: &Environment,
    on_sample: &mut F,
) -> Result<BenchmarkReport>
where
    F: FnMut(&str, RunMode, usize, f64),
{
    let events = sweep_events(config, [entry])?;
    PreparedBenchmark::new(config, entry, base_env)?.run(config, &events, base_env, on_sample)
}

// Event codes only matter when some side runs under the profiler.
fn sweep_events<'e>(
    config: &HarnessConfig,
    entries: impl IntoIterator<Item = &'e BenchmarkEntry>,
) -> Result<Vec<SamplingEvent>> {
    let monitored = entries.into_iter().any(|e| {
        e.baseline.mode == RunMode::Monitored || e.treatment.mode == RunMode::Monitored
    });
    if !monitored {
        return Ok(Vec::new());
    }
    select_events(&config.events)
        .with_context(|| format!("invalid event selection '{}'", config.events))
}

/// A catalog entry whose run files have been parsed and resolved.
struct PreparedBenchmark<'e> {
    entry: &'e BenchmarkEntry,
    baseline: PreparedSide<'e>,
    treatment: PreparedSide<'e>,
}

struct PreparedSide<'e> {
    side: &'e SideConfig,
    run_file: PathBuf,
    working_dir: PathBuf,
    descriptor: RunDescriptor,
}

impl<'e> PreparedBenchmark<'e> {
    fn new(config: &HarnessConfig, entry: &'e BenchmarkEntry, base_env: &Environment) -> Result<Self> {
        let baseline = PreparedSide::new(config, &entry.baseline, base_env)
            .with_context(|| format!("{}: baseline configuration invalid", entry.name))?;
        let treatment = PreparedSide::new(config, &entry.treatment, base_env)
            .with_context(|| format!("{}: treatment configuration invalid", entry.name))?;
        Ok(Self {
            entry,
            baseline,
            treatment,
        })
    }

    fn run<F>(
        &self,
        config: &HarnessConfig,
        events: &[SamplingEvent],
        base_env: &Environment,
        on_sample: &mut F,
    ) -> Result<BenchmarkReport>
    where
        F: FnMut(&str, RunMode, usize, f64),
    {
        let entry = self.entry;
        let baseline = self
            .baseline
            .collect(config, entry, events, base_env, on_sample)
            .with_context(|| format!("{}: baseline run failed", entry.name))?;
        let treatment = self
            .treatment
            .collect(config, entry, events, base_env, on_sample)
            .with_context(|| format!("{}: treatment run failed", entry.name))?;
        let comparison = compare(&baseline.statistic, &treatment.statistic, entry.unit);
        Ok(BenchmarkReport {
            name: entry.name.clone(),
            unit: entry.unit,
            baseline,
            treatment,
            comparison,
        })
    }
}

impl<'e> PreparedSide<'e> {
    fn new(config: &HarnessConfig, side: &'e SideConfig, base_env: &Environment) -> Result<Self> {
        let run_file = config.resolve_path(&side.run_file);
        let working_dir = match &side.working_dir {
            Some(dir) => config.resolve_path(dir),
            None => run_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| config.base_dir.clone()),
        };
        let descriptor = RunDescriptor::load(&run_file, base_env)?;
        Ok(Self {
            side,
            run_file,
            working_dir,
            descriptor,
        })
    }

    fn collect<F>(
        &self,
        config: &HarnessConfig,
        entry: &BenchmarkEntry,
        events: &[SamplingEvent],
        base_env: &Environment,
        on_sample: &mut F,
    ) -> Result<SideReport>
    where
        F: FnMut(&str, RunMode, usize, f64),
    {
        let mode = self.side.mode;
        let runner = ProcessRunner::new(config.timing.clone(), &self.working_dir)
            .dry_run(config.dry_run)
            .timeout(config.timeout());
        let affinity = config.affinity_prefix();
        let mut collector = Collector::new(&runner, base_env, &affinity)
            .tooling(config.monitor.clone())
            .metric(entry.metric.clone())
            .show_output(config.show_output)
            .tolerate_capture_failures(config.tolerate_capture_failures);
        if mode == RunMode::Monitored {
            collector = collector.events(events.to_vec());
        }

        info!(
            benchmark = %entry.name,
            mode = mode.as_str(),
            working_dir = %self.working_dir.display(),
            "collecting samples"
        );
        let samples = collector.collect_with(&self.descriptor, config.iterations, mode, |i, v| {
            on_sample(&entry.name, mode, i, v)
        })?;
        let statistic = samples.reduce();
        if statistic.failed > 0 {
            warn!(
                benchmark = %entry.name,
                mode = mode.as_str(),
                failed = statistic.failed,
                total = samples.len(),
                "iterations without a measurement"
            );
        }
        Ok(SideReport {
            run_file: self.run_file.clone(),
            mode,
            display_name: self.descriptor.display_name.clone(),
            samples,
            statistic,
        })
    }
}

pub fn format_benchmark_line(report: &BenchmarkReport) -> String {
    let unit = match report.unit {
        Unit::Latency => "s",
        Unit::Throughput => "",
    };
    format!(
        "{}  baseline(average:{:.2}{unit}, std:{:.2}, failed:{})  treatment(average:{:.2}{unit}, std:{:.2}, failed:{})  {}:{:.2}X",
        report.name,
        report.baseline.statistic.center,
        report.baseline.statistic.spread,
        report.baseline.statistic.failed,
        report.treatment.statistic.center,
        report.treatment.statistic.spread,
        report.treatment.statistic.failed,
        report.comparison.direction,
        report.comparison.ratio,
        unit = unit,
    )
}

pub fn write_report(path: &Path, report: &SweepReport) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(report)?;
    atomic_write_bytes(path, &bytes)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("report");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
