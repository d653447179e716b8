//! Genomic intervals and the chain planner.
//!
//! Coordinates are 1-based and inclusive, so two intervals on the same
//! chromosome are adjacent when `previous.end + 1 == next.start`.

use std::fmt::{self, Display};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::IntervalError;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GenomicInterval {
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
}

impl GenomicInterval {
    pub fn new(
        chromosome: impl Into<String>,
        start: u64,
        end: u64,
    ) -> Result<Self, IntervalError> {
        let chromosome = chromosome.into();
        if start > end {
            return Err(IntervalError::Inverted {
                chromosome,
                start,
                end,
            });
        }
        Ok(Self {
            chromosome,
            start,
            end,
        })
    }

    /// Number of bases covered.
    pub fn width(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether `next` starts on the base right after this interval ends.
    pub fn is_adjacent_to(&self, next: &GenomicInterval) -> bool {
        self.chromosome == next.chromosome && self.end.checked_add(1) == Some(next.start)
    }
}

impl Display for GenomicInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.chromosome, self.start, self.end)
    }
}

impl FromStr for GenomicInterval {
    type Err = String;

    /// Parses `chr:start-end`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chromosome, range) = s
            .rsplit_once(':')
            .ok_or_else(|| "expected chr:start-end".to_string())?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| "expected start-end after ':'".to_string())?;
        let start = parse_position(start)?;
        let end = parse_position(end)?;
        GenomicInterval::new(chromosome, start, end).map_err(|e| e.to_string())
    }
}

fn parse_position(raw: &str) -> Result<u64, String> {
    raw.trim()
        .replace(',', "")
        .parse::<u64>()
        .map_err(|e| format!("bad position `{raw}`: {e}"))
}

/// Ordered run of adjacent intervals on one chromosome, processed as one shard.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IntervalChain {
    members: Vec<GenomicInterval>,
}

impl IntervalChain {
    fn starting_at(interval: GenomicInterval) -> Self {
        Self {
            members: vec![interval],
        }
    }

    fn last(&self) -> &GenomicInterval {
        // Chains are created with one member and only grow.
        &self.members[self.members.len() - 1]
    }

    pub fn members(&self) -> &[GenomicInterval] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn chromosome(&self) -> &str {
        &self.members[0].chromosome
    }

    /// The single interval this chain collapses to.
    pub fn span(&self) -> GenomicInterval {
        GenomicInterval {
            chromosome: self.chromosome().to_string(),
            start: self.members[0].start,
            end: self.last().end,
        }
    }
}

impl Display for IntervalChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.span())
    }
}

/// How many input intervals may be merged into one chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MergeCount {
    /// A pinned chain length.
    Fixed { count: usize },
    /// `max(1, floor(num_intervals / num_samples / 2.5))`.
    Derived,
}

impl Default for MergeCount {
    fn default() -> Self {
        MergeCount::Fixed { count: 3 }
    }
}

impl MergeCount {
    /// Resolve to a concrete chain length for this cohort.
    ///
    /// The cohort-derived value is always computed; a fixed setting that
    /// disagrees with it is logged so the discrepancy stays visible.
    pub fn resolve(&self, num_intervals: usize, num_samples: usize) -> usize {
        let derived = derived_merge_count(num_intervals, num_samples);
        match *self {
            MergeCount::Fixed { count } => {
                let fixed = count.max(1);
                if fixed != derived {
                    warn!(
                        fixed,
                        derived,
                        num_intervals,
                        num_samples,
                        "configured merge count differs from the cohort-derived merge count"
                    );
                }
                fixed
            }
            MergeCount::Derived => derived,
        }
    }
}

/// `floor(num_intervals / num_samples / 2.5)`, never below 1.
pub fn derived_merge_count(num_intervals: usize, num_samples: usize) -> usize {
    let samples = num_samples.max(1) as f64;
    let possible = (num_intervals as f64 / samples / 2.5).floor() as usize;
    possible.max(1)
}

/// Greedy single-pass merger of sorted, disjoint intervals into chains.
#[derive(Clone, Copy, Debug)]
pub struct IntervalPlanner {
    merge_count: usize,
}

impl IntervalPlanner {
    pub fn new(merge_count: usize) -> Self {
        Self {
            merge_count: merge_count.max(1),
        }
    }

    pub fn merge_count(&self) -> usize {
        self.merge_count
    }

    /// Merge `intervals` into chains of at most `merge_count` adjacent members.
    ///
    /// A chain is flushed when it is full or when the next interval is not
    /// adjacent to it; adjacency breaks win over reaching `merge_count`.
    pub fn plan(&self, intervals: &[GenomicInterval]) -> Vec<IntervalChain> {
        let mut chains = Vec::new();
        let mut remaining = intervals.iter();
        let Some(first) = remaining.next() else {
            return chains;
        };

        let mut current = IntervalChain::starting_at(first.clone());
        for next in remaining {
            if current.len() >= self.merge_count || !current.last().is_adjacent_to(next) {
                let full = std::mem::replace(&mut current, IntervalChain::starting_at(next.clone()));
                chains.push(full);
            } else {
                current.members.push(next.clone());
            }
        }
        chains.push(current);

        debug!(
            intervals = intervals.len(),
            chains = chains.len(),
            merge_count = self.merge_count,
            "planned interval chains"
        );
        chains
    }
}

/// Check the list invariants: non-empty, each chromosome in one contiguous
/// block, and strictly increasing non-overlapping positions within it.
pub fn validate_intervals(intervals: &[GenomicInterval]) -> Result<(), IntervalError> {
    if intervals.is_empty() {
        return Err(IntervalError::Empty);
    }

    let mut finished: Vec<&str> = Vec::new();
    for pair in intervals.windows(2) {
        let (previous, next) = (&pair[0], &pair[1]);
        let unsorted = || IntervalError::Unsorted {
            previous: previous.to_string(),
            next: next.to_string(),
        };
        if previous.chromosome == next.chromosome {
            if next.start <= previous.end {
                return Err(unsorted());
            }
        } else {
            finished.push(previous.chromosome.as_str());
            if finished.contains(&next.chromosome.as_str()) {
                return Err(unsorted());
            }
        }
    }
    Ok(())
}

/// Parse an interval list. Accepts `chr:start-end` lines and tab separated
/// `chr start end ...` lines; `@` headers, `#` comments and blank lines are skipped.
pub fn parse_interval_list(reader: impl BufRead) -> Result<Vec<GenomicInterval>, IntervalError> {
    let mut intervals = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.map_err(|source| IntervalError::Io {
            path: format!("<line {line_no}>").into(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('@') || trimmed.starts_with('#') {
            continue;
        }

        let parse_error = |reason: String| IntervalError::Parse {
            line: line_no,
            content: trimmed.to_string(),
            reason,
        };

        let interval = if trimmed.contains('\t') {
            let mut fields = trimmed.split('\t');
            let chromosome = fields.next().unwrap_or_default();
            let start = fields
                .next()
                .ok_or_else(|| parse_error("missing start column".into()))
                .and_then(|raw| parse_position(raw).map_err(parse_error))?;
            let end = fields
                .next()
                .ok_or_else(|| parse_error("missing end column".into()))
                .and_then(|raw| parse_position(raw).map_err(parse_error))?;
            GenomicInterval::new(chromosome, start, end)?
        } else {
            trimmed.parse::<GenomicInterval>().map_err(parse_error)?
        };
        intervals.push(interval);
    }
    Ok(intervals)
}

/// Read and validate an interval list file.
pub fn read_interval_list(path: &Path) -> Result<Vec<GenomicInterval>, IntervalError> {
    let file = File::open(path).map_err(|source| IntervalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let intervals = parse_interval_list(BufReader::new(file))?;
    validate_intervals(&intervals)?;
    Ok(intervals)
}
