use crate::template::{resolve, Environment};
use crate::HarnessError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const INFORMATION: &str = "information";
pub const ENVIRONMENT: &str = "environment";
pub const SAMPLING: &str = "sampling";

/// Sectioned `key = value` source, order preserving, keys case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFile {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl RunFile {
    pub fn parse(text: &str) -> Result<Self, HarnessError> {
        let mut file = RunFile::default();
        let mut current: Option<usize> = None;
        let mut last_key: Option<usize> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim_end_matches('\r');
            let trimmed = line.trim();
            if trimmed.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with(char::is_whitespace) {
                if let (Some(s), Some(k)) = (current, last_key) {
                    let value = &mut file.sections[s].1[k].1;
                    value.push('\n');
                    value.push_str(trimmed);
                    continue;
                }
            }

            if let Some(header) = trimmed.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or_else(|| {
                    HarnessError::InvalidRunFile {
                        line: line_no,
                        message: format!("unterminated section header '{}'", trimmed),
                    }
                })?;
                current = Some(file.section_index(name.trim()));
                last_key = None;
                continue;
            }

            let section = current.ok_or_else(|| HarnessError::InvalidRunFile {
                line: line_no,
                message: "entry appears before any [section] header".to_string(),
            })?;
            let split = trimmed.find(['=', ':']).ok_or_else(|| HarnessError::InvalidRunFile {
                line: line_no,
                message: format!("expected 'key = value', found '{}'", trimmed),
            })?;
            let key = trimmed[..split].trim();
            if key.is_empty() {
                return Err(HarnessError::InvalidRunFile {
                    line: line_no,
                    message: "empty key".to_string(),
                });
            }
            let value = strip_inline_comment(trimmed[split + 1..].trim());

            let entries = &mut file.sections[section].1;
            let pos = match entries.iter().position(|(k, _)| k == key) {
                Some(pos) => {
                    entries[pos].1 = value.to_string();
                    pos
                }
                None => {
                    entries.push((key.to_string(), value.to_string()));
                    entries.len() - 1
                }
            };
            last_key = Some(pos);
        }
        Ok(file)
    }

    fn section_index(&mut self, name: &str) -> usize {
        match self.sections.iter().position(|(n, _)| n == name) {
            Some(pos) => pos,
            None => {
                self.sections.push((name.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        }
    }

    pub fn section(&self, name: &str) -> Option<&[(String, String)]> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, entries)| entries.as_slice())
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// `;` only starts a comment when preceded by whitespace.
fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b';' && i > 0 && bytes[i - 1].is_ascii_whitespace() {
            return value[..i].trim_end();
        }
    }
    value
}

pub fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Source keys cannot carry `:` or `=`, so event names spell them `?` and `--`.
pub fn normalize_event_name(key: &str) -> String {
    key.replace('?', ":").replace("--", "=")
}

/// Launch configuration of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunDescriptor {
    pub executable: String,
    pub launch_script: Option<String>,
    pub arguments: String,
    pub display_name: String,
    /// Raw templates, expanded when applied.
    pub environment: Vec<(String, String)>,
    pub sampling: BTreeMap<String, u64>,
}

impl RunDescriptor {
    pub fn load(path: &Path, env: &Environment) -> Result<Self, HarnessError> {
        let text = fs::read_to_string(path).map_err(|source| HarnessError::Io {
            action: "read run file",
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, env)
    }

    pub fn parse(text: &str, env: &Environment) -> Result<Self, HarnessError> {
        Self::from_run_file(&RunFile::parse(text)?, env)
    }

    /// Values are resolved against `env` overlaid with the file's own
    /// `environment` section, so `exe = $ROOT$/bin/app` may use a `ROOT`
    /// declared alongside it.
    pub fn from_run_file(file: &RunFile, env: &Environment) -> Result<Self, HarnessError> {
        let missing: Vec<String> = ["exe", "shown_name", "arguments"]
            .iter()
            .filter(|key| file.get(INFORMATION, key).is_none())
            .map(|key| format!("[{}] {}", INFORMATION, key))
            .collect();
        if !missing.is_empty() {
            return Err(HarnessError::MissingRequiredField { fields: missing });
        }

        let environment: Vec<(String, String)> =
            file.section(ENVIRONMENT).map(<[_]>::to_vec).unwrap_or_default();
        let mut scope = env.clone();
        apply_overrides(&environment, &mut scope)?;

        let field = |key: &str| -> Result<Option<String>, HarnessError> {
            file.get(INFORMATION, key)
                .map(|raw| resolve(strip_quotes(raw), &scope))
                .transpose()
        };
        let required = |key: &str| -> Result<String, HarnessError> {
            field(key)?.ok_or_else(|| HarnessError::MissingRequiredField {
                fields: vec![format!("[{}] {}", INFORMATION, key)],
            })
        };

        let executable = required("exe")?;
        let display_name = required("shown_name")?;
        let arguments = required("arguments")?;
        let launch_script = field("launch_script")?;

        let mut sampling = BTreeMap::new();
        for (key, raw) in file.section(SAMPLING).unwrap_or_default() {
            let event = normalize_event_name(key);
            let value = resolve(strip_quotes(raw), &scope)?;
            let interval = value.trim().parse::<u64>().map_err(|_| {
                HarnessError::InvalidSamplingInterval {
                    event: event.clone(),
                    value: value.clone(),
                }
            })?;
            sampling.insert(event, interval);
        }

        Ok(RunDescriptor {
            executable,
            launch_script,
            arguments,
            display_name,
            environment,
            sampling,
        })
    }

    pub fn uses_script(&self) -> bool {
        self.launch_script.is_some()
    }

    /// Expands and installs the environment overrides in declaration order;
    /// later entries may reference earlier ones.
    pub fn apply_environment(&self, env: &mut Environment) -> Result<(), HarnessError> {
        apply_overrides(&self.environment, env)
    }

    /// Launch script when present, otherwise the executable followed by its
    /// arguments. Relative paths resolve against `working_dir`.
    pub fn main_command(&self, working_dir: &Path) -> String {
        let target = self.launch_script.as_deref().unwrap_or(&self.executable);
        let path = Path::new(target);
        let mut command = if path.is_absolute() {
            target.to_string()
        } else {
            working_dir.join(path).to_string_lossy().to_string()
        };
        if !self.uses_script() && !self.arguments.is_empty() {
            command.push(' ');
            command.push_str(&self.arguments);
        }
        command
    }

    /// File name of the executable, used to name profiler artifacts.
    pub fn executable_name(&self) -> &str {
        Path::new(&self.executable)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.executable)
    }
}

fn apply_overrides(
    overrides: &[(String, String)],
    env: &mut Environment,
) -> Result<(), HarnessError> {
    for (key, raw) in overrides {
        let value = resolve(strip_quotes(raw), env)?;
        env.set(key.clone(), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const APP_RUN: &str = r#"
# workload description
[information]
shown_name = "App"
exe = "$ROOT$/bin/app"
arguments = "-n $THREADS$ input.dat"

[environment]
ROOT = /opt
DATA = $ROOT$/data

[sampling]
RTM_RETIRED?ABORTED = 5000
cycles?precise--2 = 2000000
"#;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn builds_descriptor_with_resolved_fields() {
        let d = RunDescriptor::parse(APP_RUN, &env(&[("THREADS", "4")])).expect("parse");
        assert_eq!(d.display_name, "App");
        assert_eq!(d.executable, "/opt/bin/app");
        assert_eq!(d.arguments, "-n 4 input.dat");
        assert!(!d.uses_script());
        assert_eq!(d.executable_name(), "app");
        assert_eq!(d.sampling.get("RTM_RETIRED:ABORTED"), Some(&5000));
        assert_eq!(d.sampling.get("cycles:precise=2"), Some(&2_000_000));
    }

    #[test]
    fn root_from_caller_environment_resolves_exe() {
        let text = "[information]\nshown_name = \"App\"\nexe = \"$ROOT$/bin/app\"\narguments = \"\"\n";
        let d = RunDescriptor::parse(text, &env(&[("ROOT", "/opt")])).expect("parse");
        assert_eq!(d.executable, "/opt/bin/app");
        assert_eq!(d.arguments, "");
    }

    #[test]
    fn environment_overrides_expand_in_order_at_apply_time() {
        let d = RunDescriptor::parse(APP_RUN, &env(&[("THREADS", "1")])).expect("parse");
        assert_eq!(d.environment[1], ("DATA".to_string(), "$ROOT$/data".to_string()));

        let mut target = env(&[("THREADS", "1")]);
        d.apply_environment(&mut target).expect("apply");
        assert_eq!(target.get("ROOT"), Some("/opt"));
        assert_eq!(target.get("DATA"), Some("/opt/data"));
    }

    #[test]
    fn reports_every_missing_required_field() {
        let err = RunDescriptor::parse("[information]\nexe = a.out\n", &Environment::new())
            .expect_err("should fail");
        match &err {
            HarnessError::MissingRequiredField { fields } => {
                assert_eq!(
                    fields,
                    &vec![
                        "[information] shown_name".to_string(),
                        "[information] arguments".to_string()
                    ]
                );
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().contains("  - [information] arguments"));
    }

    #[test]
    fn missing_information_section_reports_all_three() {
        let err = RunDescriptor::parse("[environment]\nA = 1\n", &Environment::new())
            .expect_err("should fail");
        match err {
            HarnessError::MissingRequiredField { fields } => assert_eq!(fields.len(), 3),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn undefined_template_variable_fails_at_parse() {
        let err = RunDescriptor::parse(APP_RUN, &Environment::new()).expect_err("THREADS unset");
        assert!(matches!(err, HarnessError::UndefinedVariable { ref name, .. } if name == "THREADS"));
    }

    #[test]
    fn invalid_sampling_interval_is_rejected() {
        let text = "[information]\nexe=a\nshown_name=A\narguments=\n[sampling]\ncycles = often\n";
        let err = RunDescriptor::parse(text, &Environment::new()).expect_err("should fail");
        assert!(matches!(err, HarnessError::InvalidSamplingInterval { .. }));
    }

    #[test]
    fn script_mode_command_omits_arguments() {
        let text = "[information]\nexe = bin/app\nlaunch_script = \"run.sh\"\nshown_name = S\narguments = --fast\n";
        let d = RunDescriptor::parse(text, &Environment::new()).expect("parse");
        assert!(d.uses_script());
        let cwd = PathBuf::from("/work");
        assert_eq!(d.main_command(&cwd), "/work/run.sh");
    }

    #[test]
    fn direct_mode_command_joins_relative_exe_and_arguments() {
        let text = "[information]\nexe = ./bin/app\nshown_name = S\narguments = --fast 3\n";
        let d = RunDescriptor::parse(text, &Environment::new()).expect("parse");
        assert_eq!(d.main_command(Path::new("/work")), "/work/./bin/app --fast 3");

        let text = "[information]\nexe = /usr/bin/app\nshown_name = S\narguments = x\n";
        let d = RunDescriptor::parse(text, &Environment::new()).expect("parse");
        assert_eq!(d.main_command(Path::new("/work")), "/usr/bin/app x");
    }

    #[test]
    fn quotes_are_stripped_only_when_balanced() {
        assert_eq!(strip_quotes("\"abc\""), "abc");
        assert_eq!(strip_quotes("\"abc"), "\"abc");
        assert_eq!(strip_quotes("\""), "\"");
        assert_eq!(strip_quotes("\"\""), "");
    }

    #[test]
    fn run_file_syntax_rules() {
        let text = "[a]\nKey: one ; trailing\nkey = two;three\nlong = first\n  second\n[a]\nKey = replaced\n";
        let f = RunFile::parse(text).expect("parse");
        assert_eq!(f.get("a", "Key"), Some("replaced"));
        assert_eq!(f.get("a", "key"), Some("two;three"));
        assert_eq!(f.get("a", "long"), Some("first\nsecond"));
        assert_eq!(f.section("a").map(|s| s.len()), Some(3));
    }

    #[test]
    fn run_file_rejects_orphan_and_malformed_lines() {
        let err = RunFile::parse("exe = a\n").expect_err("orphan entry");
        assert!(matches!(err, HarnessError::InvalidRunFile { line: 1, .. }));
        let err = RunFile::parse("[information]\n\njust words\n").expect_err("no separator");
        assert!(matches!(err, HarnessError::InvalidRunFile { line: 3, .. }));
        let err = RunFile::parse("[information\n").expect_err("bad header");
        assert!(matches!(err, HarnessError::InvalidRunFile { line: 1, .. }));
    }
}
