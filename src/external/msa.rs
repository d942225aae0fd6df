// src/external/msa.rs

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use super::{run_tool, Aligner, ThreadBudget};
use crate::errors::{DeblurError, Result};
use crate::fasta::{read_fasta_from, write_fasta_records};
use crate::types::FastaRecord;

const MAFFT_EXE: &str = "mafft";

/// MAFFT-backed multiple sequence alignment. The aligned FASTA arrives
/// on stdout; labels pass through unchanged.
pub struct MafftAligner {
    workdir: PathBuf,
    budget: Arc<ThreadBudget>,
    threads: usize,
}

impl MafftAligner {
    pub fn new(workdir: PathBuf, budget: Arc<ThreadBudget>, threads: usize) -> Self {
        Self { workdir, budget, threads }
    }
}

impl Aligner for MafftAligner {
    fn align(&self, seqs: &[FastaRecord]) -> Result<Vec<FastaRecord>> {
        if seqs.is_empty() {
            return Ok(Vec::new());
        }
        std::fs::create_dir_all(&self.workdir)?;
        let input_fp = self.workdir.join("msa_input.fa");
        write_fasta_records(&input_fp, seqs)?;

        let lease = self.budget.acquire(self.threads);
        let output = run_tool(
            MAFFT_EXE,
            Command::new(MAFFT_EXE)
                .arg("--quiet")
                .arg("--parttree")
                .arg("--auto")
                .arg("--thread")
                .arg(lease.threads().to_string())
                .arg(&input_fp),
        )?;
        drop(lease);

        let aligned = read_fasta_from(output.stdout.as_slice())?;
        validate_alignment(seqs.len(), &aligned)?;
        Ok(aligned)
    }
}

/// An alignment must keep every input record and give all outputs one
/// shared length; anything else is malformed tool output.
pub fn validate_alignment(input_count: usize, aligned: &[FastaRecord]) -> Result<()> {
    if aligned.len() != input_count {
        return Err(DeblurError::tool(
            MAFFT_EXE,
            format!("alignment returned {} of {} records", aligned.len(), input_count),
        ));
    }
    let Some(first) = aligned.first() else {
        return Ok(());
    };
    let width = first.sequence.len();
    if aligned.iter().any(|r| r.sequence.len() != width) {
        return Err(DeblurError::tool(MAFFT_EXE, "aligned records differ in length"));
    }
    Ok(())
}
