// src/feature_table.rs

use ahash::AHashMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::{DeblurError, Result};
use crate::types::{DereplicationMap, SequenceTable};

/// Sparse sample x sequence abundance matrix plus the representative
/// read label chosen for each surviving sequence.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    /// (sample id, sequence, abundance), one entry per occupied cell
    entries: Vec<(String, String, f64)>,
    rep_labels: AHashMap<String, String>,
}

impl FeatureTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, String, f64)] {
        &self.entries
    }

    /// Sequence -> representative original read label.
    pub fn representative_labels(&self) -> &AHashMap<String, String> {
        &self.rep_labels
    }

    /// Distinct sample ids, sorted.
    pub fn sample_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|(s, _, _)| s.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Distinct sequences, sorted.
    pub fn sequences(&self) -> Vec<String> {
        let mut seqs: Vec<String> = self.entries.iter().map(|(_, q, _)| q.clone()).collect();
        seqs.sort();
        seqs.dedup();
        seqs
    }
}

/// Builds one sample's feature table from its denoised sequences.
///
/// Each surviving sequence's final abundance is attributed to samples
/// in proportion to where its original reads came from (per the
/// dereplication map); after the per-sample split there is normally a
/// single sample and the full abundance lands on it. The
/// lexicographically first originating label becomes the sequence's
/// representative label.
pub fn build_table(
    denoised: &SequenceTable,
    derep_map: &DereplicationMap,
    delimiter: &str,
) -> Result<FeatureTable> {
    if denoised.is_empty() {
        return Err(DeblurError::empty("build-table"));
    }

    let mut entries: Vec<(String, String, f64)> = Vec::new();
    let mut rep_labels: AHashMap<String, String> = AHashMap::new();

    let mut seqs: Vec<&String> = denoised.keys().collect();
    seqs.sort();

    for seq in seqs {
        let rec = &denoised[seq];
        let labels = derep_map.get(seq).unwrap_or(&rec.labels);

        let mut sorted_labels: Vec<&String> = labels.iter().collect();
        sorted_labels.sort();
        let rep = sorted_labels
            .first()
            .map(|l| l.to_string())
            .unwrap_or_else(|| seq.clone());
        rep_labels.insert(seq.clone(), rep);

        // Per-sample read counts behind this unique sequence
        let mut sample_counts: AHashMap<&str, usize> = AHashMap::new();
        for label in labels {
            let sample = match label.split_once(delimiter) {
                Some((s, _)) => s,
                None => label.as_str(),
            };
            *sample_counts.entry(sample).or_insert(0) += 1;
        }
        let total: usize = sample_counts.values().sum();
        if total == 0 {
            continue;
        }

        let mut samples: Vec<(&str, usize)> = sample_counts.into_iter().collect();
        samples.sort();
        for (sample, count) in samples {
            let share = rec.abundance * count as f64 / total as f64;
            entries.push((sample.to_string(), seq.clone(), share));
        }
    }

    Ok(FeatureTable { entries, rep_labels })
}

/// Union of per-sample tables. Entries stay independent per sample; a
/// sequence seen in several samples keeps one cell per sample, and
/// denoising is never re-applied across samples.
pub fn merge_tables(tables: Vec<FeatureTable>) -> FeatureTable {
    let mut merged = FeatureTable::default();
    for table in tables {
        merged.entries.extend(table.entries);
        for (seq, label) in table.rep_labels {
            merged.rep_labels.entry(seq).or_insert(label);
        }
    }
    merged
}

// ---------- BIOM 1.0 (JSON) output ----------

#[derive(Serialize, Deserialize)]
struct BiomAxisEntry {
    id: String,
    metadata: Option<serde_json::Value>,
}

/// BIOM 1.0 sparse OTU table, rows = sequences, columns = samples.
#[derive(Serialize, Deserialize)]
struct BiomTable {
    id: Option<String>,
    format: String,
    format_url: String,
    #[serde(rename = "type")]
    table_type: String,
    generated_by: String,
    date: String,
    matrix_type: String,
    matrix_element_type: String,
    shape: [usize; 2],
    rows: Vec<BiomAxisEntry>,
    columns: Vec<BiomAxisEntry>,
    data: Vec<(usize, usize, f64)>,
}

/// Serializes the table as BIOM 1.0 JSON. Refuses an empty table.
pub fn to_biom_json(table: &FeatureTable) -> Result<String> {
    if table.is_empty() {
        return Err(DeblurError::empty("write-table"));
    }

    let sequences = table.sequences();
    let samples = table.sample_ids();
    let row_index: AHashMap<&str, usize> =
        sequences.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();
    let col_index: AHashMap<&str, usize> =
        samples.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();

    let mut data: Vec<(usize, usize, f64)> = table
        .entries()
        .iter()
        .map(|(sample, seq, abundance)| {
            (row_index[seq.as_str()], col_index[sample.as_str()], *abundance)
        })
        .collect();
    data.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let biom = BiomTable {
        id: None,
        format: "Biological Observation Matrix 1.0.0".to_string(),
        format_url: "http://biom-format.org".to_string(),
        table_type: "OTU table".to_string(),
        generated_by: format!("deblur-rs {}", env!("CARGO_PKG_VERSION")),
        date: Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        matrix_type: "sparse".to_string(),
        matrix_element_type: "float".to_string(),
        shape: [sequences.len(), samples.len()],
        rows: sequences
            .into_iter()
            .map(|id| BiomAxisEntry { id, metadata: None })
            .collect(),
        columns: samples
            .into_iter()
            .map(|id| BiomAxisEntry { id, metadata: None })
            .collect(),
        data,
    };

    Ok(serde_json::to_string_pretty(&biom)?)
}

/// Writes the BIOM JSON table to disk. Empty tables are rejected before
/// anything is created.
pub fn write_biom_table<P: AsRef<Path>>(path: P, table: &FeatureTable) -> Result<()> {
    let json = to_biom_json(table)?;
    std::fs::write(path, json)?;
    Ok(())
}
