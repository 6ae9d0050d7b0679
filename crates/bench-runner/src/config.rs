use crate::collect::{MetricSource, MonitorTooling, RunMode};
use crate::process::TimingWrapper;
use crate::template::Environment;
use anyhow::{anyhow, Context, Result};
use bench_analysis::Unit;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Harness-wide settings plus the benchmark catalog, read from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub running: RunningConfig,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_events")]
    pub events: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub show_output: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub tolerate_capture_failures: bool,
    #[serde(default)]
    pub timing: TimingWrapper,
    #[serde(default = "default_environment")]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub monitor: MonitorTooling,
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkEntry>,
    /// Directory relative catalog paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningConfig {
    #[serde(default = "default_threads")]
    pub num_threads: usize,
    #[serde(default = "default_cpu_list")]
    pub cpu_list: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkEntry {
    pub name: String,
    #[serde(default)]
    pub unit: Unit,
    #[serde(default)]
    pub metric: MetricSource,
    pub baseline: SideConfig,
    pub treatment: SideConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideConfig {
    pub run_file: PathBuf,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub mode: RunMode,
}

fn default_iterations() -> usize {
    7
}

fn default_events() -> String {
    "all".to_string()
}

fn default_threads() -> usize {
    1
}

fn default_cpu_list() -> String {
    "0".to_string()
}

fn default_environment() -> BTreeMap<String, String> {
    [("HTM_TRETRY", "5"), ("HTM_PRETRY", "1"), ("HTM_GRETRY", "5")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Default for RunningConfig {
    fn default() -> Self {
        Self {
            num_threads: default_threads(),
            cpu_list: default_cpu_list(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            running: RunningConfig::default(),
            iterations: default_iterations(),
            events: default_events(),
            dry_run: false,
            show_output: false,
            timeout_seconds: None,
            tolerate_capture_failures: false,
            timing: TimingWrapper::default(),
            environment: default_environment(),
            monitor: MonitorTooling::default(),
            benchmarks: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read harness config {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from("."));
        Self::from_yaml(&raw, base_dir)
            .with_context(|| format!("invalid harness config {}", path.display()))
    }

    pub fn from_yaml(raw: &str, base_dir: PathBuf) -> Result<Self> {
        let mut config: HarnessConfig = if raw.trim().is_empty() {
            HarnessConfig::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.base_dir = base_dir;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(anyhow!("iterations must be at least 1"));
        }
        let mut seen = BTreeSet::new();
        for entry in &self.benchmarks {
            if !seen.insert(entry.name.to_lowercase()) {
                return Err(anyhow!("duplicate benchmark name: {}", entry.name));
            }
        }
        Ok(())
    }

    /// Core binding prefix; an empty `cpu_list` leaves runs unbound.
    pub fn affinity_prefix(&self) -> String {
        let cpus = self.running.cpu_list.trim();
        if cpus.is_empty() {
            String::new()
        } else {
            format!("taskset -c {}", cpus)
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// `base` plus the thread-count variables and configured extras.
    pub fn environment(&self, mut base: Environment) -> Environment {
        let threads = self.running.num_threads.to_string();
        base.set("THREADS", threads.clone());
        base.set("OMP_NUM_THREADS", threads);
        base.set("OMP_WAIT_POLICY", "ACTIVE");
        for (k, v) in &self.environment {
            base.set(k.clone(), v.clone());
        }
        base
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// `all` or a comma separated, case-insensitive list of names. Unknown
    /// names are rejected before anything runs.
    pub fn select(&self, apps: &str) -> Result<Vec<&BenchmarkEntry>> {
        if apps.trim().eq_ignore_ascii_case("all") {
            return Ok(self.benchmarks.iter().collect());
        }
        let mut selected = Vec::new();
        let mut unknown = Vec::new();
        for name in apps.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match self
                .benchmarks
                .iter()
                .find(|b| b.name.eq_ignore_ascii_case(name))
            {
                Some(entry) => selected.push(entry),
                None => unknown.push(name.to_string()),
            }
        }
        if !unknown.is_empty() {
            return Err(anyhow!(
                "unknown benchmark(s): {} (use --list to see available names)",
                unknown.join(", ")
            ));
        }
        if selected.is_empty() {
            return Err(anyhow!("no benchmarks selected"));
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWEEP_YAML: &str = r##"
running:
  num_threads: 4
  cpu_list: "0-3"
iterations: 5
timeout_seconds: 600
environment:
  HTM_TRETRY: "9"
benchmarks:
  - name: KMeans
    baseline: { run_file: kmeans/default.run }
    treatment: { run_file: kmeans/default.run, mode: txsampler }
  - name: linkedlist
    unit: throughput
    metric: { kind: stdout_field, prefix: "#txs", index: 2 }
    baseline: { run_file: /abs/original.run, working_dir: ll }
    treatment: { run_file: /abs/optimized.run }
"##;

    #[test]
    fn empty_document_uses_defaults() {
        let c = HarnessConfig::from_yaml("", PathBuf::from("/cfg")).expect("defaults");
        assert_eq!(c.iterations, 7);
        assert_eq!(c.events, "all");
        assert_eq!(c.running.num_threads, 1);
        assert_eq!(c.affinity_prefix(), "taskset -c 0");
        assert_eq!(c.environment.get("HTM_PRETRY").map(String::as_str), Some("1"));
        assert_eq!(c.timing, TimingWrapper::default());
        assert_eq!(c.timeout(), None);
    }

    #[test]
    fn empty_cpu_list_disables_binding() {
        let c = HarnessConfig::from_yaml("running: { cpu_list: \"\" }", PathBuf::from("."))
            .expect("parse");
        assert_eq!(c.affinity_prefix(), "");
    }

    #[test]
    fn parses_catalog_entries() {
        let c = HarnessConfig::from_yaml(SWEEP_YAML, PathBuf::from("/cfg")).expect("parse");
        assert_eq!(c.iterations, 5);
        assert_eq!(c.affinity_prefix(), "taskset -c 0-3");
        assert_eq!(c.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(c.benchmarks.len(), 2);

        let kmeans = &c.benchmarks[0];
        assert_eq!(kmeans.unit, Unit::Latency);
        assert_eq!(kmeans.metric, MetricSource::Elapsed);
        assert_eq!(kmeans.baseline.mode, RunMode::Native);
        assert_eq!(kmeans.treatment.mode, RunMode::Monitored);
        assert_eq!(
            c.resolve_path(&kmeans.baseline.run_file),
            PathBuf::from("/cfg/kmeans/default.run")
        );

        let ll = &c.benchmarks[1];
        assert_eq!(ll.unit, Unit::Throughput);
        assert_eq!(
            ll.metric,
            MetricSource::StdoutField { prefix: "#txs".to_string(), index: 2 }
        );
        assert_eq!(c.resolve_path(&ll.treatment.run_file), PathBuf::from("/abs/optimized.run"));
    }

    #[test]
    fn environment_layers_threads_and_extras() {
        let c = HarnessConfig::from_yaml(SWEEP_YAML, PathBuf::from("/cfg")).expect("parse");
        let env = c.environment(Environment::from_iter([("HOME", "/root")]));
        assert_eq!(env.get("THREADS"), Some("4"));
        assert_eq!(env.get("OMP_NUM_THREADS"), Some("4"));
        assert_eq!(env.get("OMP_WAIT_POLICY"), Some("ACTIVE"));
        assert_eq!(env.get("HTM_TRETRY"), Some("9"));
        assert_eq!(env.get("HTM_GRETRY"), None);
        assert_eq!(env.get("HOME"), Some("/root"));
    }

    #[test]
    fn selection_is_case_insensitive_and_rejects_unknown_names() {
        let c = HarnessConfig::from_yaml(SWEEP_YAML, PathBuf::from("/cfg")).expect("parse");
        assert_eq!(c.select("all").expect("all").len(), 2);
        let picked = c.select("kmeans").expect("kmeans");
        assert_eq!(picked[0].name, "KMeans");
        let err = c.select("kmeans,bogus").expect_err("unknown");
        assert!(err.to_string().contains("bogus"), "{}", err);
    }

    #[test]
    fn bundled_demo_catalog_loads() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
        let c = HarnessConfig::load(&demos.join("bench.yaml")).expect("demo config");
        assert_eq!(c.benchmarks.len(), 2);
        let env = c.environment(Environment::from_iter([("HOME", "/home/u")]));
        for entry in &c.benchmarks {
            for side in [&entry.baseline, &entry.treatment] {
                let d = crate::RunDescriptor::load(&c.resolve_path(&side.run_file), &env)
                    .expect("demo run file");
                assert!(d.arguments.contains("14"), "{}", d.arguments);
            }
        }
    }

    #[test]
    fn rejects_zero_iterations_and_duplicates() {
        assert!(HarnessConfig::from_yaml("iterations: 0", PathBuf::from(".")).is_err());
        let dup = "benchmarks:\n  - name: a\n    baseline: { run_file: x }\n    treatment: { run_file: y }\n  - name: A\n    baseline: { run_file: x }\n    treatment: { run_file: y }\n";
        let err = HarnessConfig::from_yaml(dup, PathBuf::from(".")).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"), "{}", err);
    }
}
