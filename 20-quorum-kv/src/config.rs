//! Run settings.
//!
//! Settings files use one `key value` pair per line, e.g.
//!
//! ```text
//! port 9000
//! backlog 32
//! server_threads 4
//! get_frac 0.25
//! verbose false
//! ```
//!
//! Missing keys keep their defaults. Unknown keys are returned to the caller
//! so they can be reported once logging is up.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};

use crate::workload::RandomWorkloadConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    /// Unresolved client messages allowed before the send loop waits.
    pub backlog: usize,
    /// Connect attempts after the first one fails.
    pub max_retries: u32,
    pub server_threads: usize,
    pub table_size: usize,
    pub num_test_commands: usize,
    pub get_frac: f64,
    pub max_value: u32,
    pub verbose: bool,
    pub count_every: usize,
    pub connect_retry_delay_ms: u64,
    pub seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 9000,
            backlog: 64,
            max_retries: 10,
            server_threads: 4,
            table_size: 1024,
            num_test_commands: 1000,
            get_frac: 0.5,
            max_value: 65_536,
            verbose: false,
            count_every: 0,
            connect_retry_delay_ms: 3000,
            seed: None,
        }
    }
}

impl Settings {
    /// Parses a settings file on top of the defaults. Also returns the keys
    /// that were not recognized.
    pub fn parse(text: &str) -> Result<(Self, Vec<String>)> {
        let mut settings = Self::default();
        let mut unknown = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(anyhow!("line {}: expected `key value`, got '{line}'", number + 1));
            };
            let known = settings
                .set(key, value)
                .with_context(|| format!("line {}: invalid value for {key}", number + 1))?;
            if !known {
                unknown.push(key.to_string());
            }
        }
        Ok((settings, unknown))
    }

    /// Applies one `key value` pair. Returns `Ok(false)` for unknown keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "port" => self.port = value.parse()?,
            "backlog" => self.backlog = value.parse()?,
            "max_retries" => self.max_retries = value.parse()?,
            "server_threads" => self.server_threads = value.parse()?,
            "table_size" => self.table_size = value.parse()?,
            "num_test_commands" => self.num_test_commands = value.parse()?,
            "get_frac" => self.get_frac = value.parse()?,
            "max_value" => self.max_value = value.parse()?,
            "verbose" => self.verbose = parse_bool(value)?,
            "count_every" => self.count_every = value.parse()?,
            "connect_retry_delay_ms" => self.connect_retry_delay_ms = value.parse()?,
            "seed" => self.seed = Some(value.parse()?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=65_536).contains(&self.table_size),
            "table_size must be within 1..=65536, got {}",
            self.table_size
        );
        ensure!(
            (1..=65_536).contains(&self.max_value),
            "max_value must be within 1..=65536, got {}",
            self.max_value
        );
        ensure!(self.server_threads > 0, "server_threads must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.get_frac),
            "get_frac must be within [0, 1], got {}",
            self.get_frac
        );
        Ok(())
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    /// Random workload drawing keys from the whole table.
    pub fn random_workload(&self) -> RandomWorkloadConfig {
        RandomWorkloadConfig {
            transactions: self.num_test_commands,
            get_frac: self.get_frac,
            key_space: self.table_size as u32,
            max_value: self.max_value,
            count_every: self.count_every,
        }
    }
}

/// Accepts `true`/`false` in any case, and anything starting with `t`/`f`.
fn parse_bool(value: &str) -> Result<bool> {
    match value.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('t') => Ok(true),
        Some('f') => Ok(false),
        _ => Err(anyhow!("expected true or false, got '{value}'")),
    }
}
