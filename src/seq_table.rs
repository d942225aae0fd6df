// src/seq_table.rs

use ahash::AHashMap;
use std::fmt::Write as FmtWrite;

use crate::types::{DereplicationMap, FastaRecord, SequenceRecord, SequenceTable};

/// Default hard abundance floor applied at dereplication time.
pub const DEFAULT_MIN_SIZE: u64 = 2;

/// Keeps reads at least `trim_length` bases long, truncated to exactly
/// `trim_length`. Shorter reads are dropped.
pub fn trim_seqs(reads: &[FastaRecord], trim_length: usize) -> Vec<FastaRecord> {
    reads
        .iter()
        .filter(|r| r.sequence.len() >= trim_length)
        .map(|r| FastaRecord::new(r.label.clone(), &r.sequence[..trim_length]))
        .collect()
}

/// Groups identical read sequences, summing counts and collecting the
/// originating read labels. Sequences whose summed abundance falls below
/// `min_size` are dropped outright; this floor is independent of the
/// error model.
pub fn dereplicate(reads: &[FastaRecord], min_size: u64) -> (SequenceTable, DereplicationMap) {
    let mut table: SequenceTable = AHashMap::new();

    for read in reads {
        let entry = table.entry(read.sequence.clone()).or_insert_with(|| SequenceRecord {
            sequence: read.sequence.clone(),
            abundance: 0.0,
            labels: Vec::new(),
        });
        entry.abundance += 1.0;
        entry.labels.push(read.label.clone());
    }

    table.retain(|_, rec| rec.abundance >= min_size as f64);

    let derep_map: DereplicationMap =
        table.iter().map(|(seq, rec)| (seq.clone(), rec.labels.clone())).collect();

    (table, derep_map)
}

/// Splits a `label;size=N` annotation into the bare label and the
/// abundance. Labels without the annotation get an abundance of 1.
pub fn parse_size_annotation(label: &str) -> (&str, f64) {
    match label.rsplit_once(";size=") {
        Some((base, size)) => match size.trim_end_matches(';').parse::<f64>() {
            Ok(n) if n >= 0.0 => (base, n),
            _ => (label, 1.0),
        },
        None => (label, 1.0),
    }
}

/// Renders a dereplicated-FASTA label carrying its cluster abundance.
pub fn format_size_annotation(label: &str, abundance: f64) -> String {
    if (abundance.fract()).abs() < f64::EPSILON {
        format!("{label};size={}", abundance as u64)
    } else {
        format!("{label};size={abundance}")
    }
}

/// Renders the dereplication map as UC-style clustering records: one `S`
/// line per cluster seed (the first label in sorted order) followed by
/// an `H` line per remaining member. Clusters are emitted in sequence
/// order so the output is reproducible.
pub fn format_derep_map(derep_map: &DereplicationMap) -> String {
    let mut seqs: Vec<&String> = derep_map.keys().collect();
    seqs.sort();

    let mut out = String::new();
    for (cluster_id, seq) in seqs.iter().enumerate() {
        let mut labels: Vec<&String> = derep_map[*seq].iter().collect();
        labels.sort();
        let Some(seed) = labels.first() else { continue };
        writeln!(
            out,
            "S\t{}\t{}\t*\t*\t*\t*\t*\t{}\t*",
            cluster_id,
            seq.len(),
            seed
        )
        .unwrap();
        for member in &labels[1..] {
            writeln!(
                out,
                "H\t{}\t{}\t100.0\t*\t*\t*\t*\t{}\t{}",
                cluster_id,
                seq.len(),
                member,
                seed
            )
            .unwrap();
        }
    }
    out
}
