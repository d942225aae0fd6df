// src/lib.rs
pub mod types;
pub mod errors;
pub mod fasta;
pub mod error_model;
pub mod seq_table;
pub mod denoise;
pub mod feature_table;
pub mod external;
pub mod workflow;

use std::fmt::Write as FmtWrite;

use crate::feature_table::{to_biom_json, FeatureTable};
use crate::types::FastaRecord;

pub use crate::denoise::denoise;
pub use crate::error_model::ErrorProfile;
pub use crate::errors::{DeblurError, Result};
pub use crate::workflow::{run_workflow, WorkflowConfig};

/// The merged outcome of a full pipeline run. Output text is generated
/// on demand from the structured table.
#[derive(Debug)]
pub struct WorkflowResults {
    /// Merged sample x sequence feature table
    pub table: FeatureTable,
    /// Samples whose pipeline failed; reported, excluded from the merge
    pub failed_samples: Vec<String>,
    /// UC-style dereplication map text, when requested
    pub derep_map_text: Option<String>,
}

impl WorkflowResults {
    /// One FASTA record per surviving sequence, keyed by its chosen
    /// representative read label.
    pub fn rep_seq_records(&self) -> Vec<FastaRecord> {
        self.table
            .sequences()
            .into_iter()
            .map(|seq| {
                let label = self
                    .table
                    .representative_labels()
                    .get(&seq)
                    .cloned()
                    .unwrap_or_else(|| seq.clone());
                FastaRecord::new(label, seq)
            })
            .collect()
    }

    /// Generate the representative-sequence FASTA text on demand
    pub fn get_rep_seqs_fasta(&self) -> String {
        let mut output = String::new();
        for rec in self.rep_seq_records() {
            writeln!(output, ">{}\n{}", rec.label, rec.sequence).unwrap();
        }
        output
    }

    /// Generate the BIOM 1.0 JSON table on demand
    pub fn get_biom_json(&self) -> Result<String> {
        to_biom_json(&self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_table::{build_table, merge_tables};
    use crate::types::{SequenceRecord, SequenceTable};
    use ahash::AHashMap;

    fn one_sample_table(seq: &str, abundance: f64, label: &str) -> FeatureTable {
        let mut t: SequenceTable = AHashMap::new();
        t.insert(
            seq.to_string(),
            SequenceRecord {
                sequence: seq.to_string(),
                abundance,
                labels: vec![label.to_string()],
            },
        );
        let derep = t.iter().map(|(s, r)| (s.clone(), r.labels.clone())).collect();
        build_table(&t, &derep, "_").unwrap()
    }

    #[test]
    fn test_rep_seqs_fasta_text() {
        let merged = merge_tables(vec![
            one_sample_table("ACGT", 5.0, "s1_0"),
            one_sample_table("TTTT", 3.0, "s2_4"),
        ]);
        let results =
            WorkflowResults { table: merged, failed_samples: vec![], derep_map_text: None };

        let fasta = results.get_rep_seqs_fasta();
        assert_eq!(fasta, ">s1_0\nACGT\n>s2_4\nTTTT\n");
    }

    #[test]
    fn test_results_are_debug_printable() {
        let results = WorkflowResults {
            table: FeatureTable::default(),
            failed_samples: vec!["s9".to_string()],
            derep_map_text: None,
        };
        let rendered = format!("{results:?}");
        assert!(rendered.contains("WorkflowResults"));
        assert!(rendered.contains("s9"));
    }

    #[test]
    fn test_biom_json_from_results() {
        let results = WorkflowResults {
            table: merge_tables(vec![one_sample_table("ACGT", 5.0, "s1_0")]),
            failed_samples: vec![],
            derep_map_text: None,
        };
        let json = results.get_biom_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["shape"], serde_json::json!([1, 1]));
    }
}
