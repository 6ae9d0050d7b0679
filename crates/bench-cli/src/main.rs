use anyhow::{anyhow, Context, Result};
use bench_analysis::{reduce, ReducedStatistic};
use bench_runner::{
    format_benchmark_line, run_sweep, select_events, write_report, Collector, Environment,
    HarnessConfig, ProcessRunner, RunDescriptor, RunMode, SweepReport,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "bench", version = "0.3.0", about = "Benchmark measurement harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "native", alias = "baseline")]
    Native,
    #[value(name = "monitored", alias = "txsampler")]
    Monitored,
}

impl From<ModeArg> for RunMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Native => RunMode::Native,
            ModeArg::Monitored => RunMode::Monitored,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Collect samples for one run file.
    Run {
        run_file: PathBuf,
        #[arg(short = 'r', long, value_enum, default_value = "native")]
        mode: ModeArg,
        #[arg(short = 'i', long)]
        iterations: Option<usize>,
        #[arg(short = 'e', long)]
        events: Option<String>,
        #[arg(short = 't', long)]
        threads: Option<usize>,
        #[arg(short = 'c', long)]
        cpu_list: Option<String>,
        /// Harness configuration supplying timing, monitor and environment settings.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory the workload runs in; defaults to the run file's directory.
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(long)]
        timeout: Option<u64>,
        /// After a monitored run, report where the profile database was written.
        #[arg(long)]
        report_database: bool,
        #[arg(long)]
        show_output: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved launch configuration of a run file.
    Describe {
        run_file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run baseline/treatment pairs from a harness configuration.
    Sweep {
        config: PathBuf,
        #[arg(default_value = "all")]
        apps: String,
        #[arg(long)]
        list: bool,
        #[arg(short = 'i', long)]
        iterations: Option<usize>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        json: bool,
    },
    /// Reduce literal samples (`nan` marks a failed iteration).
    Reduce {
        #[arg(required = true, allow_negative_numbers = true)]
        values: Vec<f64>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    init_logging(command_verbose(&cli.command));
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new(level)
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            run_file,
            mode,
            iterations,
            events,
            threads,
            cpu_list,
            config,
            workdir,
            timeout,
            report_database,
            show_output,
            dry_run,
            verbose: _,
            json,
        } => {
            let mode = RunMode::from(mode);
            if report_database && mode != RunMode::Monitored {
                return Err(anyhow!("--report-database requires -r monitored"));
            }
            let mut config = match config {
                Some(path) => HarnessConfig::load(&path)?,
                None => HarnessConfig::default(),
            };
            if let Some(n) = iterations {
                config.iterations = n;
            }
            if let Some(codes) = events {
                config.events = codes;
            }
            if let Some(n) = threads {
                config.running.num_threads = n;
            }
            if let Some(cpus) = cpu_list {
                config.running.cpu_list = cpus;
            }
            if timeout.is_some() {
                config.timeout_seconds = timeout;
            }
            config.show_output = (config.show_output || show_output) && !json;
            config.dry_run |= dry_run;
            if config.iterations == 0 {
                return Err(anyhow!("iterations must be at least 1"));
            }

            let env = config.environment(Environment::from_process());
            let descriptor = RunDescriptor::load(&run_file, &env)?;
            let working_dir = workdir.unwrap_or_else(|| run_file_dir(&run_file));
            let runner = ProcessRunner::new(config.timing.clone(), &working_dir)
                .dry_run(config.dry_run)
                .timeout(config.timeout());
            let affinity = config.affinity_prefix();
            let mut collector = Collector::new(&runner, &env, &affinity)
                .tooling(config.monitor.clone())
                .show_output(config.show_output)
                .tolerate_capture_failures(config.tolerate_capture_failures);
            if mode == RunMode::Monitored {
                collector = collector.events(select_events(&config.events)?);
            }

            let name = descriptor.display_name.clone();
            let samples =
                collector.collect_with(&descriptor, config.iterations, mode, |i, value| {
                    if !json {
                        println!("{}", measurement_line(mode, &name, i, value));
                    }
                })?;
            let statistic = samples.reduce();
            let database = report_database.then(|| {
                ProfileDatabase::locate(
                    &working_dir,
                    &config.monitor.database_name(descriptor.executable_name()),
                )
            });
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "database": database.as_ref().map(ProfileDatabase::to_json),
                    "mode": mode.as_str(),
                    "run_file": run_file.display().to_string(),
                    "working_dir": working_dir.display().to_string(),
                    "descriptor": descriptor,
                    "samples": samples.values(),
                    "statistic": statistic_to_json(&statistic),
                    "dry_run": config.dry_run
                })));
            }
            println!("{}", statistic_line(&name, &statistic));
            if let Some(database) = &database {
                println!("{}", database.line());
            }
        }
        Commands::Describe { run_file, json } => {
            let env = HarnessConfig::default().environment(Environment::from_process());
            let descriptor = RunDescriptor::load(&run_file, &env)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "run_file": run_file.display().to_string(),
                    "descriptor": descriptor
                })));
            }
            println!("run_file: {}", run_file.display());
            println!("name: {}", descriptor.display_name);
            println!("executable: {}", descriptor.executable);
            println!("arguments: {}", descriptor.arguments);
            match &descriptor.launch_script {
                Some(script) => println!("launch_script: {}", script),
                None => println!("launch_script: (none)"),
            }
            for (key, value) in &descriptor.environment {
                println!("env: {}={}", key, value);
            }
            for (event, interval) in &descriptor.sampling {
                println!("sampling: {}@{}", event, interval);
            }
        }
        Commands::Sweep {
            config,
            apps,
            list,
            iterations,
            dry_run,
            out,
            verbose: _,
            json,
        } => {
            let config_path = config;
            let mut config = HarnessConfig::load(&config_path)?;
            if list {
                let names: Vec<&str> = config.benchmarks.iter().map(|b| b.name.as_str()).collect();
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "sweep",
                        "benchmarks": names
                    })));
                }
                for name in names {
                    println!("{}", name);
                }
                return Ok(None);
            }
            if let Some(n) = iterations {
                if n == 0 {
                    return Err(anyhow!("iterations must be at least 1"));
                }
                config.iterations = n;
            }
            config.dry_run |= dry_run;
            if json {
                config.show_output = false;
            }

            let entries = config.select(&apps)?;
            let env = config.environment(Environment::from_process());
            let report = run_sweep(&config, &entries, &env, |name, mode, i, value| {
                if !json {
                    println!("{}", measurement_line(mode, name, i, value));
                }
            })?;
            if let Some(path) = &out {
                write_report(path, &report)
                    .with_context(|| format!("failed to write report {}", path.display()))?;
                tracing::info!(path = %path.display(), "report written");
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sweep",
                    "config": config_path.display().to_string(),
                    "report": report,
                    "report_path": out.map(|p| p.display().to_string())
                })));
            }
            print_sweep(&report);
            if let Some(path) = &out {
                println!("report: {}", path.display());
            }
        }
        Commands::Reduce { values, json } => {
            let statistic = reduce(&values);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "reduce",
                    "statistic": statistic_to_json(&statistic)
                })));
            }
            println!("{}", statistic_line("samples", &statistic));
        }
    }
    Ok(None)
}

struct ProfileDatabase {
    path: PathBuf,
    exists: bool,
}

impl ProfileDatabase {
    fn locate(working_dir: &Path, name: &str) -> Self {
        let path = working_dir.join(name);
        let exists = path.is_dir();
        Self { path, exists }
    }

    fn line(&self) -> String {
        if self.exists {
            format!("profile database: {}", self.path.display())
        } else {
            format!(
                "profile database: {} was not created; the profiler step failed",
                self.path.display()
            )
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "path": self.path.display().to_string(),
            "exists": self.exists
        })
    }
}

fn run_file_dir(run_file: &Path) -> PathBuf {
    run_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn measurement_line(mode: RunMode, name: &str, iteration: usize, value: f64) -> String {
    format!("##MEASUREMENT: {} {} {} {:.2}", mode, name, iteration, value)
}

fn statistic_line(name: &str, statistic: &ReducedStatistic) -> String {
    format!(
        "{}  average:{:.2}  std:{:.2}  retained:{}  failed:{}  trimmed:{}",
        name,
        statistic.center,
        statistic.spread,
        statistic.retained,
        statistic.failed,
        statistic.trimmed
    )
}

fn print_sweep(report: &SweepReport) {
    for benchmark in &report.benchmarks {
        println!("{}", format_benchmark_line(benchmark));
    }
    match (report.geomean, &report.geomean_error) {
        (Some(g), _) => println!("geomean: {:.2}X", g),
        (None, Some(err)) => println!("geomean: unavailable ({})", err),
        (None, None) => println!("geomean: unavailable"),
    }
}

// NaN statistics serialize as null.
fn statistic_to_json(statistic: &ReducedStatistic) -> Value {
    json!({
        "average": statistic.center,
        "std": statistic.spread,
        "retained": statistic.retained,
        "failed": statistic.failed,
        "trimmed": statistic.trimmed,
        "degenerate": statistic.is_degenerate()
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Sweep { json, .. }
        | Commands::Reduce { json, .. } => *json,
    }
}

fn command_verbose(command: &Commands) -> bool {
    match command {
        Commands::Run { verbose, .. } | Commands::Sweep { verbose, .. } => *verbose,
        Commands::Describe { .. } | Commands::Reduce { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse_with_mode_aliases() {
        let cli = Cli::try_parse_from([
            "bench", "run", "kmeans.run", "-r", "txsampler", "-i", "3", "-e", "1,2", "--json",
        ])
        .expect("parse");
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Run {
                mode,
                iterations,
                events,
                ..
            } => {
                assert_eq!(RunMode::from(mode), RunMode::Monitored);
                assert_eq!(iterations, Some(3));
                assert_eq!(events.as_deref(), Some("1,2"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn report_database_flag_parses() {
        let cli = Cli::try_parse_from([
            "bench", "run", "app.run", "-r", "monitored", "--report-database",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run { report_database, .. } => assert!(report_database),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn report_database_requires_monitored_mode() {
        let cli = Cli::try_parse_from(["bench", "run", "app.run", "--report-database"])
            .expect("parse");
        let err = run_command(cli.command).expect_err("native mode");
        assert!(err.to_string().contains("requires -r monitored"), "{}", err);
    }

    #[test]
    fn profile_database_reports_presence() {
        let dir = std::env::temp_dir().join(format!(
            "bench_cli_db_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        std::fs::create_dir_all(dir.join("hpctoolkit-app-database")).expect("db dir");

        let found = ProfileDatabase::locate(&dir, "hpctoolkit-app-database");
        assert!(found.exists);
        assert!(found.line().starts_with("profile database: "));
        assert_eq!(found.to_json()["exists"], true);

        let missing = ProfileDatabase::locate(&dir, "hpctoolkit-other-database");
        assert!(!missing.exists);
        assert!(missing.line().contains("was not created"), "{}", missing.line());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reduce_accepts_nan_and_negative_values() {
        let cli = Cli::try_parse_from(["bench", "reduce", "1.5", "nan", "-2"]).expect("parse");
        match cli.command {
            Commands::Reduce { values, .. } => {
                assert_eq!(values.len(), 3);
                assert!(values[1].is_nan());
                assert_eq!(values[2], -2.0);
            }
            _ => panic!("expected reduce"),
        }
    }

    #[test]
    fn sweep_defaults_to_all_benchmarks() {
        let cli = Cli::try_parse_from(["bench", "sweep", "bench.yaml"]).expect("parse");
        match cli.command {
            Commands::Sweep { apps, list, .. } => {
                assert_eq!(apps, "all");
                assert!(!list);
            }
            _ => panic!("expected sweep"),
        }
    }

    #[test]
    fn measurement_line_rounds_to_two_places() {
        assert_eq!(
            measurement_line(RunMode::Native, "KMeans", 3, 1.2345),
            "##MEASUREMENT: native KMeans 3 1.23"
        );
        assert_eq!(
            measurement_line(RunMode::Monitored, "x", 1, f64::NAN),
            "##MEASUREMENT: monitored x 1 NaN"
        );
    }

    #[test]
    fn json_error_shape() {
        let v = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "command_failed");
        assert_eq!(v["error"]["message"], "boom");
    }
}
