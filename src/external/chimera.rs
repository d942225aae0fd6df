// src/external/chimera.rs

use ahash::AHashSet;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use super::{run_tool, ChimeraFilter, ThreadBudget};
use crate::errors::Result;
use crate::fasta::{read_fasta_records, write_fasta_records};
use crate::seq_table::parse_size_annotation;
use crate::types::FastaRecord;

const VSEARCH_EXE: &str = "vsearch";

/// VSEARCH uchime_denovo-backed chimera removal. Input labels must
/// carry `;size=` abundance annotations; uchime_denovo orders
/// candidates and votes parents by abundance skew. The skew parameters
/// below disable the score-based calls and keep only the parent-vote
/// test, so borderline sequences are not thrown away.
pub struct VsearchChimeraFilter {
    workdir: PathBuf,
    budget: Arc<ThreadBudget>,
    threads: usize,
}

impl VsearchChimeraFilter {
    pub fn new(workdir: PathBuf, budget: Arc<ThreadBudget>, threads: usize) -> Self {
        Self { workdir, budget, threads }
    }
}

impl ChimeraFilter for VsearchChimeraFilter {
    fn detect_and_remove(&self, aligned: &[FastaRecord]) -> Result<Vec<FastaRecord>> {
        if aligned.is_empty() {
            return Ok(Vec::new());
        }
        std::fs::create_dir_all(&self.workdir)?;
        let input_fp = self.workdir.join("chimera_input.fa");
        let output_fp = self.workdir.join("nonchimeras.fa");
        write_fasta_records(&input_fp, aligned)?;

        let lease = self.budget.acquire(self.threads);
        run_tool(
            VSEARCH_EXE,
            Command::new(VSEARCH_EXE)
                .arg("--uchime_denovo")
                .arg(&input_fp)
                .arg("--nonchimeras")
                .arg(&output_fp)
                .arg("--sizein")
                .arg("--dn")
                .arg("0.000001")
                .arg("--xn")
                .arg("1000")
                .arg("--minh")
                .arg("10000000")
                .arg("--mindiffs")
                .arg("5")
                .arg("--fasta_width")
                .arg("0")
                .arg("--threads")
                .arg(lease.threads().to_string()),
        )?;
        drop(lease);

        let survivors = read_fasta_records(&output_fp)?;
        Ok(match_survivors(aligned, &survivors))
    }
}

/// Picks the caller's records that survived chimera detection. Matching
/// goes by the bare label (vsearch may rewrite or strip the `;size=`
/// annotation, and its output drops gap columns, so neither labels nor
/// sequences compare verbatim).
pub fn match_survivors(aligned: &[FastaRecord], survivors: &[FastaRecord]) -> Vec<FastaRecord> {
    let surviving: AHashSet<&str> =
        survivors.iter().map(|r| parse_size_annotation(&r.label).0).collect();
    aligned
        .iter()
        .filter(|r| surviving.contains(parse_size_annotation(&r.label).0))
        .cloned()
        .collect()
}
