// src/types.rs

use ahash::AHashMap;

/// A minimal representation of one FASTA read.
#[derive(Debug, Clone, PartialEq)]
pub struct FastaRecord {
    /// Full label as it appeared after '>' (whitespace-trimmed)
    pub label: String,
    /// The nucleotide sequence; '-' marks an alignment gap
    pub sequence: String,
}

impl FastaRecord {
    pub fn new(label: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self { label: label.into(), sequence: sequence.into() }
    }

    /// Sample id portion of the label: everything before the first
    /// `delimiter`. A label with no delimiter belongs to an implicit
    /// single sample named after the whole label.
    pub fn sample_id(&self, delimiter: &str) -> &str {
        match self.label.split_once(delimiter) {
            Some((sample, _)) => sample,
            None => &self.label,
        }
    }
}

/// A unique post-dereplication sequence with its summed read count and
/// the labels of the reads that collapsed into it.
#[derive(Debug, Clone)]
pub struct SequenceRecord {
    pub sequence: String,
    /// Summed read count; the denoiser subtracts fractional expected
    /// error mass from it, floored at 0. Never negative.
    pub abundance: f64,
    /// Labels of the original reads mapping to this sequence
    pub labels: Vec<String>,
}

/// Unique sequence -> record. Invariant: a record's `sequence` field
/// equals its map key.
pub type SequenceTable = AHashMap<String, SequenceRecord>;

/// Unique sequence -> originating read labels, kept alongside the table
/// so the aggregator can attribute abundances back to samples.
pub type DereplicationMap = AHashMap<String, Vec<String>>;
