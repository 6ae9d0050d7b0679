mod collect;
mod config;
mod descriptor;
mod error;
mod process;
mod sweep;
mod template;

pub use collect::{
    apply_sampling_overrides, render_events, select_events, Collector, MetricSource,
    MonitorTooling, RunMode, SamplingEvent,
};
pub use config::{BenchmarkEntry, HarnessConfig, RunningConfig, SideConfig};
pub use descriptor::{normalize_event_name, strip_quotes, RunDescriptor, RunFile};
pub use error::HarnessError;
pub use process::{
    compose, shell_quote, CommandOutput, ComposedCommand, ProcessRunner, TimedRun,
    TimingWrapper, DEFAULT_PREFIX_ENV, DEFAULT_SCRATCH_PATH, DEFAULT_TIME_PROGRAM,
};
pub use sweep::{
    format_benchmark_line, run_benchmark, run_sweep, write_report, BenchmarkReport, SideReport,
    SweepReport,
};
pub use template::{resolve, Environment};
