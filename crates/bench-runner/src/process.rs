use crate::template::Environment;
use crate::HarnessError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Read};
use std::num::ParseFloatError;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_TIME_PROGRAM: &str = "/usr/bin/time";
pub const DEFAULT_SCRATCH_PATH: &str = "/tmp/measured_time.tmp";
pub const DEFAULT_PREFIX_ENV: &str = "TXSAMPLER_CMD";

/// Wall-clock wrapper invoked as `<program> -f %e -o <scratch_path> ...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingWrapper {
    pub program: String,
    pub scratch_path: PathBuf,
    /// Variable through which launch scripts receive the timed prefix.
    pub prefix_env: String,
}

impl Default for TimingWrapper {
    fn default() -> Self {
        Self {
            program: DEFAULT_TIME_PROGRAM.to_string(),
            scratch_path: PathBuf::from(DEFAULT_SCRATCH_PATH),
            prefix_env: DEFAULT_PREFIX_ENV.to_string(),
        }
    }
}

impl TimingWrapper {
    /// The scratch path is quoted when it needs to be. Launch scripts expand
    /// the exported prefix unquoted, so script mode still needs a path
    /// without whitespace.
    pub fn command(&self) -> String {
        format!(
            "{} -f %e -o {}",
            self.program,
            shell_quote(&self.scratch_path.to_string_lossy())
        )
    }
}

/// Single-quotes `arg` for `sh` unless it only holds characters the shell
/// passes through untouched.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedCommand {
    pub line: String,
    /// Set in script mode: the timed prefix the launch script applies itself.
    pub timed_prefix: Option<String>,
}

pub fn compose(
    timing: &TimingWrapper,
    prefix: &str,
    main_command: &str,
    use_script: bool,
) -> ComposedCommand {
    let wrapper = timing.command();
    if use_script {
        ComposedCommand {
            line: main_command.to_string(),
            timed_prefix: Some(join_nonempty(&[&wrapper, prefix])),
        }
    } else {
        ComposedCommand {
            line: join_nonempty(&[&wrapper, prefix, main_command]),
            timed_prefix: None,
        }
    }
}

fn join_nonempty(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimedRun {
    pub stdout: String,
    pub stderr: String,
    /// First line of the scratch timing file, untouched.
    pub elapsed: String,
}

impl TimedRun {
    pub fn seconds(&self) -> Result<f64, ParseFloatError> {
        self.elapsed.trim().parse::<f64>()
    }
}

/// Runs shell command lines one at a time. Every timed run shares the single
/// scratch file of its [`TimingWrapper`], so runs must never overlap.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timing: TimingWrapper,
    working_dir: PathBuf,
    dry_run: bool,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timing: TimingWrapper, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            timing,
            working_dir: working_dir.into(),
            dry_run: false,
            timeout: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn timing(&self) -> &TimingWrapper {
        &self.timing
    }

    /// Untimed run of an auxiliary command.
    pub fn execute(&self, command: &str, env: &Environment) -> Result<CommandOutput, HarnessError> {
        debug!(command, dry_run = self.dry_run, "EXECUTE");
        if self.dry_run {
            return Ok(CommandOutput::default());
        }
        self.spawn_and_wait(command, env, None)
    }

    /// Timed run of `main_command` behind `prefix`. The elapsed time is read
    /// back from the scratch file, never from the command's own output.
    pub fn run(
        &self,
        prefix: &str,
        main_command: &str,
        use_script: bool,
        env: &Environment,
    ) -> Result<TimedRun, HarnessError> {
        let composed = compose(&self.timing, prefix, main_command, use_script);
        debug!(
            command = %composed.line,
            timed_prefix = ?composed.timed_prefix,
            dry_run = self.dry_run,
            "EXECUTE"
        );
        if self.dry_run {
            return Ok(TimedRun {
                elapsed: "0".to_string(),
                ..TimedRun::default()
            });
        }

        let scratch = &self.timing.scratch_path;
        match fs::remove_file(scratch) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(HarnessError::Io {
                    action: "remove stale timing file",
                    path: scratch.clone(),
                    source,
                })
            }
        }

        let extra = composed
            .timed_prefix
            .as_deref()
            .map(|p| (self.timing.prefix_env.as_str(), p));
        let output = self.spawn_and_wait(&composed.line, env, extra)?;
        let elapsed = read_elapsed(scratch)?;
        Ok(TimedRun {
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed,
        })
    }

    fn spawn_and_wait(
        &self,
        command: &str,
        env: &Environment,
        extra: Option<(&str, &str)>,
    ) -> Result<CommandOutput, HarnessError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(&self.working_dir);
        cmd.env_clear();
        cmd.envs(env.iter());
        if let Some((key, value)) = extra {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Own process group, so a timeout can take down everything the
        // command started.
        cmd.process_group(0);

        let spawn_err = |source| HarnessError::Spawn {
            command: command.to_string(),
            source,
        };
        let child = cmd.spawn().map_err(spawn_err)?;
        let (status, stdout, stderr) = match self.timeout {
            None => {
                let output = child.wait_with_output().map_err(spawn_err)?;
                (output.status, output.stdout, output.stderr)
            }
            Some(timeout) => wait_with_timeout(child, command, timeout)?,
        };
        if !status.success() {
            warn!(command, status = %status, "command exited unsuccessfully");
        }
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }
}

fn wait_with_timeout(
    mut child: Child,
    command: &str,
    timeout: Duration,
) -> Result<(std::process::ExitStatus, Vec<u8>, Vec<u8>), HarnessError> {
    let start = Instant::now();
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let spawn_err = |source| HarnessError::Spawn {
        command: command.to_string(),
        source,
    };
    let status = loop {
        if let Some(status) = child.try_wait().map_err(spawn_err)? {
            break status;
        }
        if start.elapsed() > timeout {
            kill_process_group(&mut child, command);
            let _ = child.wait();
            return Err(HarnessError::Timeout {
                command: command.to_string(),
                timeout,
            });
        }
        thread::sleep(Duration::from_millis(50));
    };
    let collect = |handle: Option<thread::JoinHandle<Vec<u8>>>| {
        handle
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default()
    };
    Ok((status, collect(stdout), collect(stderr)))
}

// The child leads its own group (see `spawn_and_wait`), so its pid is the
// group id. Reader threads are not joined afterwards.
fn kill_process_group(child: &mut Child, command: &str) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg only sends a signal; pgid names a group this process created.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        debug!(command, error = %err, "failed to kill process group; killing child");
        if let Err(err) = child.kill() {
            debug!(command, error = %err, "failed to kill timed out command");
        }
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(err) = reader.read_to_end(&mut buf) {
            debug!(error = %err, read = buf.len(), "failed to drain command output");
        }
        buf
    })
}

fn read_elapsed(path: &Path) -> Result<String, HarnessError> {
    let contents = fs::read_to_string(path).map_err(|e| HarnessError::TimingCaptureFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    match contents.lines().next().map(str::trim) {
        Some(line) if !line.is_empty() => Ok(line.to_string()),
        _ => Err(HarnessError::TimingCaptureFailed {
            path: path.to_path_buf(),
            reason: "timing file is empty".to_string(),
        }),
    }
}
