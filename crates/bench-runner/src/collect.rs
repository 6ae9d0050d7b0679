use crate::descriptor::RunDescriptor;
use crate::process::{ProcessRunner, TimedRun};
use crate::template::Environment;
use crate::HarnessError;
use bench_analysis::SampleSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Direct timed invocation.
    #[default]
    #[serde(alias = "baseline")]
    Native,
    /// Timed invocation under the sampling profiler, bracketed by its
    /// structure-recovery and aggregation steps.
    #[serde(alias = "txsampler")]
    Monitored,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Native => "native",
            RunMode::Monitored => "monitored",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" | "baseline" => Ok(RunMode::Native),
            "monitored" | "txsampler" => Ok(RunMode::Monitored),
            other => Err(format!(
                "unknown run mode '{}' (expected native or monitored)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SamplingEvent {
    pub name: String,
    pub interval: u64,
}

const EVENT_TABLE: [(&str, &str, u64); 4] = [
    ("1", "cycles:precise=2", 1_000_000),
    ("2", "RTM_RETIRED:ABORTED", 10_000),
    ("3", "RTM_RETIRED:COMMIT", 3_000),
    ("4", "MEM_UOPS_RETIRED:ALL_STORES", 100_000),
];

/// Comma separated event codes; `all` stands for every known code.
pub fn select_events(codes: &str) -> Result<Vec<SamplingEvent>, HarnessError> {
    let expanded = codes.replace("all", "1,2,3,4");
    expanded
        .split(',')
        .map(str::trim)
        .map(|code| {
            EVENT_TABLE
                .iter()
                .find(|(c, _, _)| *c == code)
                .map(|(_, name, interval)| SamplingEvent {
                    name: name.to_string(),
                    interval: *interval,
                })
                .ok_or_else(|| HarnessError::UnknownEventCode {
                    code: code.to_string(),
                })
        })
        .collect()
}

/// Per-workload intervals win over the defaults; events the workload does not
/// mention keep theirs.
pub fn apply_sampling_overrides(
    events: &[SamplingEvent],
    overrides: &BTreeMap<String, u64>,
) -> Vec<SamplingEvent> {
    events
        .iter()
        .map(|e| SamplingEvent {
            name: e.name.clone(),
            interval: overrides.get(&e.name).copied().unwrap_or(e.interval),
        })
        .collect()
}

pub fn render_events(events: &[SamplingEvent]) -> String {
    events
        .iter()
        .map(|e| format!("-e {}@{}", e.name, e.interval))
        .collect::<Vec<_>>()
        .join(" ")
}

/// External profiler commands used by monitored runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorTooling {
    pub structure_tool: String,
    pub launcher: String,
    pub profiler: String,
    pub artifact_prefix: String,
}

impl Default for MonitorTooling {
    fn default() -> Self {
        Self {
            structure_tool: "hpcstruct".to_string(),
            launcher: "hpcrun".to_string(),
            profiler: "hpcprof-mpi".to_string(),
            artifact_prefix: "hpctoolkit-".to_string(),
        }
    }
}

impl MonitorTooling {
    pub fn structure_command(&self, executable: &str) -> String {
        format!("{} {}", self.structure_tool, executable)
    }

    pub fn launch_prefix(&self, affinity_prefix: &str, events: &[SamplingEvent]) -> String {
        let rendered = render_events(events);
        [affinity_prefix, self.launcher.as_str(), rendered.as_str()]
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn profile_command(&self, exe_name: &str) -> String {
        format!(
            "{profiler} -o {database} -S ./{exe}.hpcstruct -I ../ {prefix}{exe}-measurements",
            profiler = self.profiler,
            database = self.database_name(exe_name),
            prefix = self.artifact_prefix,
            exe = exe_name,
        )
    }

    /// Directory name the profiler writes its aggregated database to.
    pub fn database_name(&self, exe_name: &str) -> String {
        format!("{}{}-database", self.artifact_prefix, exe_name)
    }

    /// Removes `*.hpcstruct` files and `<artifact_prefix>*` entries left in
    /// `dir` by a previous iteration. Returns how many entries were removed.
    pub fn clean_workspace(&self, dir: &Path) -> Result<usize, HarnessError> {
        let io_err = |action, source| HarnessError::Io {
            action,
            path: dir.to_path_buf(),
            source,
        };
        let mut removed = 0;
        for entry in fs::read_dir(dir).map_err(|e| io_err("list", e))? {
            let entry = entry.map_err(|e| io_err("list", e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.ends_with(".hpcstruct") || name.starts_with(&self.artifact_prefix)) {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|source| HarnessError::Io {
                action: "remove profiler artifact",
                path: path.clone(),
                source,
            })?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Where an iteration's measurement is read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSource {
    /// Seconds recorded by the timing wrapper.
    #[default]
    Elapsed,
    /// Whitespace separated field `index` of the first stdout line starting
    /// with `prefix`, e.g. a throughput counter printed by the workload.
    StdoutField { prefix: String, index: usize },
}

impl MetricSource {
    pub fn extract(&self, run: &TimedRun) -> Option<f64> {
        match self {
            MetricSource::Elapsed => run.seconds().ok(),
            MetricSource::StdoutField { prefix, index } => run
                .stdout
                .lines()
                .map(str::trim)
                .find(|l| l.starts_with(prefix.as_str()))
                .and_then(|l| l.split_whitespace().nth(*index))
                .and_then(|field| field.parse::<f64>().ok()),
        }
    }
}

/// Drives a [`ProcessRunner`] for a fixed number of sequential iterations.
#[derive(Debug, Clone)]
pub struct Collector<'a> {
    runner: &'a ProcessRunner,
    env: &'a Environment,
    affinity_prefix: String,
    events: Vec<SamplingEvent>,
    tooling: MonitorTooling,
    metric: MetricSource,
    show_output: bool,
    tolerate_capture_failures: bool,
}

impl<'a> Collector<'a> {
    pub fn new(runner: &'a ProcessRunner, env: &'a Environment, affinity_prefix: &str) -> Self {
        Self {
            runner,
            env,
            affinity_prefix: affinity_prefix.to_string(),
            events: Vec::new(),
            tooling: MonitorTooling::default(),
            metric: MetricSource::Elapsed,
            show_output: false,
            tolerate_capture_failures: false,
        }
    }

    pub fn events(mut self, events: Vec<SamplingEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn tooling(mut self, tooling: MonitorTooling) -> Self {
        self.tooling = tooling;
        self
    }

    pub fn metric(mut self, metric: MetricSource) -> Self {
        self.metric = metric;
        self
    }

    pub fn show_output(mut self, show: bool) -> Self {
        self.show_output = show;
        self
    }

    pub fn tolerate_capture_failures(mut self, tolerate: bool) -> Self {
        self.tolerate_capture_failures = tolerate;
        self
    }

    pub fn collect(
        &self,
        descriptor: &RunDescriptor,
        iterations: usize,
        mode: RunMode,
    ) -> Result<SampleSet, HarnessError> {
        self.collect_with(descriptor, iterations, mode, |_, _| {})
    }

    /// Like [`Collector::collect`], calling `on_sample(iteration, value)`
    /// (1-based) as each measurement lands.
    pub fn collect_with<F>(
        &self,
        descriptor: &RunDescriptor,
        iterations: usize,
        mode: RunMode,
        mut on_sample: F,
    ) -> Result<SampleSet, HarnessError>
    where
        F: FnMut(usize, f64),
    {
        let mut env = self.env.clone();
        descriptor.apply_environment(&mut env)?;
        let main_command = descriptor.main_command(self.runner.working_dir());
        let events = apply_sampling_overrides(&self.events, &descriptor.sampling);

        let mut samples = SampleSet::with_capacity(iterations);
        for iteration in 1..=iterations {
            let outcome = match mode {
                RunMode::Native => self.runner.run(
                    &self.affinity_prefix,
                    &main_command,
                    descriptor.uses_script(),
                    &env,
                ),
                RunMode::Monitored => {
                    self.monitored_iteration(descriptor, &main_command, &events, &env)
                }
            };
            let value = match outcome {
                Ok(run) => {
                    self.echo_output(&run.stdout, &run.stderr);
                    self.metric.extract(&run).unwrap_or_else(|| {
                        warn!(
                            benchmark = %descriptor.display_name,
                            iteration,
                            elapsed = %run.elapsed,
                            "measurement did not parse; recording NaN"
                        );
                        f64::NAN
                    })
                }
                Err(err @ HarnessError::Timeout { .. }) => {
                    warn!(benchmark = %descriptor.display_name, iteration, error = %err, "recording NaN");
                    f64::NAN
                }
                Err(err @ HarnessError::TimingCaptureFailed { .. })
                    if self.tolerate_capture_failures =>
                {
                    warn!(benchmark = %descriptor.display_name, iteration, error = %err, "recording NaN");
                    f64::NAN
                }
                Err(err) => return Err(err),
            };
            info!(
                mode = mode.as_str(),
                benchmark = %descriptor.display_name,
                iteration,
                value,
                "measurement"
            );
            on_sample(iteration, value);
            samples.push(value);
        }
        Ok(samples)
    }

    fn monitored_iteration(
        &self,
        descriptor: &RunDescriptor,
        main_command: &str,
        events: &[SamplingEvent],
        env: &Environment,
    ) -> Result<TimedRun, HarnessError> {
        let workdir = self.runner.working_dir();
        if self.runner.is_dry_run() {
            debug!(dir = %workdir.display(), "skipping profiler artifact cleanup in dry run");
        } else {
            let removed = self.tooling.clean_workspace(workdir)?;
            debug!(dir = %workdir.display(), removed, "cleaned profiler artifacts");
        }

        let structure = self
            .runner
            .execute(&self.tooling.structure_command(&descriptor.executable), env)?;
        self.echo_output(&structure.stdout, &structure.stderr);

        let prefix = self.tooling.launch_prefix(&self.affinity_prefix, events);
        let run = self
            .runner
            .run(&prefix, main_command, descriptor.uses_script(), env)?;

        let profile = self
            .runner
            .execute(&self.tooling.profile_command(descriptor.executable_name()), env)?;
        self.echo_output(&profile.stdout, &profile.stderr);
        Ok(run)
    }

    fn echo_output(&self, stdout: &str, stderr: &str) {
        if !self.show_output {
            return;
        }
        if !stdout.is_empty() {
            println!("{}", stdout);
        }
        if !stderr.is_empty() {
            println!("{}", stderr);
        }
    }
}
