use crate::HarnessError;
use std::collections::BTreeMap;

/// Variables visible to templates and handed to every child process.
///
/// The harness owns one of these explicitly instead of mutating the process
/// environment, so per-benchmark overrides never leak across benchmarks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment. Entries that are not
    /// valid UTF-8 are skipped.
    pub fn from_process() -> Self {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Expands `$NAME$` placeholders. Splitting on `$` must give an odd number of
/// segments; odd-indexed segments are variable names, the rest is literal.
/// There is no escape for a literal `$`.
pub fn resolve(input: &str, env: &Environment) -> Result<String, HarnessError> {
    let segments: Vec<&str> = input.split('$').collect();
    if segments.len() % 2 == 0 {
        return Err(HarnessError::MalformedTemplate {
            input: input.to_string(),
        });
    }
    let mut out = String::with_capacity(input.len());
    for (idx, segment) in segments.iter().enumerate() {
        if idx % 2 == 0 {
            out.push_str(segment);
            continue;
        }
        let value = env
            .get(segment)
            .ok_or_else(|| HarnessError::UndefinedVariable {
                name: segment.to_string(),
                input: input.to_string(),
            })?;
        out.push_str(value);
    }
    Ok(out)
}
