use std::{
    fmt::Display,
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
};

use rand::{
    distributions::{Alphanumeric, DistString},
    thread_rng,
};
use tracing::debug;

/// Length of a random delimiter used for multi-line output values.
const DELIMITER_LENGTH: usize = 20;

/// Replace every character outside of `[A-Za-z0-9_]` with an underscore.
pub(crate) fn sanitize_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Named step outputs.
///
/// When an output file is configured, values are appended to it in the GitHub Actions
/// `GITHUB_OUTPUT` format, otherwise they are printed to the standard output.
pub(crate) struct Outputs {
    /// File that outputs are appended to.
    file: Option<PathBuf>,

    /// Every value set so far, in order.
    values: Vec<(String, String)>,
}

impl Outputs {
    /// Create a new output sink.
    pub(crate) fn new(file: Option<PathBuf>) -> Self {
        Self {
            file,
            values: Vec::new(),
        }
    }

    /// Set a named output value.
    pub(crate) fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        debug!(key, value, "setting output");

        let record = format_record(key, value);

        match &self.file {
            Some(path) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?
                .write_all(record.as_bytes())?,
            None => print!("{record}"),
        }

        self.values.push((key.to_owned(), value.to_owned()));

        Ok(())
    }

    /// Look up the most recent value of a named output.
    #[cfg(test)]
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Every value set so far, in order.
    pub(crate) fn values(&self) -> &[(String, String)] {
        &self.values
    }
}

/// Format a single output record.
///
/// Multi-line values are wrapped into a random delimiter, which can't clash with the value.
fn format_record(key: &str, value: &str) -> String {
    if !value.contains('\n') {
        return format!("{key}={value}\n");
    }

    let delimiter = loop {
        let delimiter = format!(
            "ghadelimiter_{}",
            Alphanumeric.sample_string(&mut thread_rng(), DELIMITER_LENGTH)
        );

        if !value.contains(&delimiter) {
            break delimiter;
        }
    };

    format!("{key}<<{delimiter}\n{value}\n{delimiter}\n")
}

/// Report a fatal error as a workflow error annotation.
pub(crate) fn fail(message: impl Display) {
    let message = message
        .to_string()
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A");

    println!("::error::{message}");
}
