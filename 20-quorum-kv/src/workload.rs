//! Transaction sources for the coordinator.
//!
//! A workload is any iterator of [`Transaction`]s. Two are provided: a
//! seeded random mix of GETs and PUTs, and a replayed script with one
//! transaction per line.

use std::str::FromStr;

use anyhow::{Context, Result, anyhow, ensure};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transaction {
    Get { key: u16 },
    Put { key: u16, value: u16 },
}

impl Transaction {
    pub fn key(&self) -> u16 {
        match *self {
            Transaction::Get { key } | Transaction::Put { key, .. } => key,
        }
    }
}

impl FromStr for Transaction {
    type Err = anyhow::Error;

    /// Parses `GET <key>` or `PUT <key> <value>`, case-insensitively.
    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first() else {
            return Err(anyhow!("empty transaction"));
        };
        let number = |text: &str, what: &str| -> Result<u16> {
            text.parse::<u16>()
                .with_context(|| format!("{what} '{text}' is not a 16-bit unsigned integer"))
        };

        match (command.to_uppercase().as_str(), parts.len()) {
            ("GET", 2) => Ok(Transaction::Get {
                key: number(parts[1], "key")?,
            }),
            ("PUT", 3) => Ok(Transaction::Put {
                key: number(parts[1], "key")?,
                value: number(parts[2], "value")?,
            }),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            (other, _) => Err(anyhow!("unknown transaction '{other}'")),
        }
    }
}

/// Parses a transaction script. Blank lines are skipped and a line reading
/// `END` stops the script early.
pub fn parse_script(text: &str) -> Result<Vec<Transaction>> {
    let mut transactions = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("END") {
            break;
        }
        let transaction = line
            .parse()
            .with_context(|| format!("line {}: '{line}'", number + 1))?;
        transactions.push(transaction);
    }
    Ok(transactions)
}

#[derive(Debug, Clone)]
pub struct RandomWorkloadConfig {
    pub transactions: usize,
    /// Probability that a transaction is a GET.
    pub get_frac: f64,
    /// Keys are drawn from `0..key_space`.
    pub key_space: u32,
    /// Values are drawn from `0..max_value`.
    pub max_value: u32,
    /// Log progress every this many transactions. Zero disables it.
    pub count_every: usize,
}

/// Uniform random GET/PUT mix.
pub struct RandomWorkload {
    config: RandomWorkloadConfig,
    rng: StdRng,
    generated: usize,
}

impl RandomWorkload {
    pub fn new(config: RandomWorkloadConfig, seed: Option<u64>) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&config.get_frac),
            "get_frac must be within [0, 1], got {}",
            config.get_frac
        );
        ensure!(
            (1..=65_536).contains(&config.key_space),
            "key space must be within 1..=65536, got {}",
            config.key_space
        );
        ensure!(
            (1..=65_536).contains(&config.max_value),
            "max_value must be within 1..=65536, got {}",
            config.max_value
        );
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            rng,
            generated: 0,
        })
    }
}

impl Iterator for RandomWorkload {
    type Item = Transaction;

    fn next(&mut self) -> Option<Transaction> {
        if self.generated >= self.config.transactions {
            return None;
        }
        let count_every = self.config.count_every;
        if count_every > 0 && self.generated % count_every == 0 {
            info!(generated = self.generated, "workload progress");
        }
        self.generated += 1;

        let key = self.rng.gen_range(0..self.config.key_space) as u16;
        let transaction = if self.rng.gen_bool(self.config.get_frac) {
            Transaction::Get { key }
        } else {
            let value = self.rng.gen_range(0..self.config.max_value) as u16;
            Transaction::Put { key, value }
        };

        if self.generated == self.config.transactions {
            info!(generated = self.generated, "last transaction generated");
        }
        Some(transaction)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.config.transactions - self.generated;
        (remaining, Some(remaining))
    }
}
