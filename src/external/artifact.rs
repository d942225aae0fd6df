// src/external/artifact.rs

use ahash::AHashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use super::{run_tool, ArtifactFilter, ThreadBudget};
use crate::errors::{DeblurError, Result};
use crate::fasta::{read_fasta_records, write_fasta_records};
use crate::types::FastaRecord;

const SORTMERNA_EXE: &str = "sortmerna";
const INDEXDB_EXE: &str = "indexdb_rna";

/// SortMeRNA-backed artifact filter: keeps sequences aligning to at
/// least one reference database (or, with `negate`, discards them).
/// Indexes missing for a raw reference are built into `index_dir` by
/// `prepare_indexes`, which must run before any concurrent `filter`
/// calls. Each `filter` call writes only into its own scratch
/// directory.
#[derive(Debug)]
pub struct SortMeRnaFilter {
    ref_fps: Vec<PathBuf>,
    ref_db_fps: Vec<PathBuf>,
    index_dir: PathBuf,
    budget: Arc<ThreadBudget>,
}

impl SortMeRnaFilter {
    /// Validates the reference configuration up front: when prebuilt
    /// index paths are given there must be exactly one per reference
    /// FASTA, in the same order.
    pub fn new(
        ref_fps: Vec<PathBuf>,
        ref_db_fps: Vec<PathBuf>,
        index_dir: PathBuf,
        budget: Arc<ThreadBudget>,
    ) -> Result<Self> {
        if ref_fps.is_empty() {
            return Err(DeblurError::config("ref-fp", "at least one reference is required"));
        }
        if !ref_db_fps.is_empty() && ref_db_fps.len() != ref_fps.len() {
            return Err(DeblurError::config(
                "ref-db-fp",
                format!(
                    "got {} indexed references for {} reference files; counts must match",
                    ref_db_fps.len(),
                    ref_fps.len()
                ),
            ));
        }
        Ok(Self { ref_fps, ref_db_fps, index_dir, budget })
    }

    /// Index path for reference `i`: the prebuilt one when supplied,
    /// otherwise a generated index under `index_dir`.
    fn index_path(&self, i: usize) -> PathBuf {
        if let Some(db) = self.ref_db_fps.get(i) {
            return db.clone();
        }
        let stem = self.ref_fps[i]
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("ref{i}"));
        self.index_dir.join(format!("{stem}.idx"))
    }

    /// Builds every missing reference index, once, before the sample
    /// pipelines fan out. With prebuilt indexes for all references this
    /// is a no-op.
    pub fn prepare_indexes(&self) -> Result<()> {
        if self.ref_db_fps.len() == self.ref_fps.len() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.index_dir)?;
        for i in 0..self.ref_fps.len() {
            if self.ref_db_fps.get(i).is_some() {
                continue;
            }
            // indexdb_rna writes several <index>.* files
            run_tool(
                INDEXDB_EXE,
                Command::new(INDEXDB_EXE).arg("--ref").arg(format!(
                    "{},{}",
                    self.ref_fps[i].display(),
                    self.index_path(i).display()
                )),
            )?;
        }
        Ok(())
    }

    /// Labels of input sequences that aligned against reference `i`.
    /// Tool output lands under the caller's scratch directory.
    fn matched_labels(
        &self,
        input_fp: &Path,
        i: usize,
        threads: usize,
        scratch_dir: &Path,
    ) -> Result<AHashSet<String>> {
        let aligned_prefix = scratch_dir.join(format!("aligned_ref{i}"));

        let lease = self.budget.acquire(threads);
        run_tool(
            SORTMERNA_EXE,
            Command::new(SORTMERNA_EXE)
                .arg("--ref")
                .arg(format!("{},{}", self.ref_fps[i].display(), self.index_path(i).display()))
                .arg("--reads")
                .arg(input_fp)
                .arg("--aligned")
                .arg(&aligned_prefix)
                .arg("--fastx")
                .arg("--num_alignments")
                .arg("1")
                .arg("-a")
                .arg(lease.threads().to_string()),
        )?;
        drop(lease);

        let aligned_fp = aligned_prefix.with_extension("fasta");
        let aligned = read_fasta_records(&aligned_fp)?;
        Ok(aligned.into_iter().map(|r| r.label).collect())
    }
}

impl ArtifactFilter for SortMeRnaFilter {
    fn filter(
        &self,
        seqs: &[FastaRecord],
        negate: bool,
        threads: usize,
        scratch_dir: &Path,
    ) -> Result<Vec<FastaRecord>> {
        if seqs.is_empty() {
            return Ok(Vec::new());
        }
        std::fs::create_dir_all(scratch_dir)?;
        let input_fp = scratch_dir.join("artifact_input.fa");
        write_fasta_records(&input_fp, seqs)?;

        let mut matched: AHashSet<String> = AHashSet::new();
        for i in 0..self.ref_fps.len() {
            matched.extend(self.matched_labels(&input_fp, i, threads, scratch_dir)?);
        }

        Ok(apply_matches(seqs, &matched, negate))
    }
}

/// Keeps database hits, or with `negate` keeps everything but the
/// hits. Input order is preserved.
pub fn apply_matches(
    seqs: &[FastaRecord],
    matched: &AHashSet<String>,
    negate: bool,
) -> Vec<FastaRecord> {
    seqs.iter()
        .filter(|r| matched.contains(&r.label) != negate)
        .cloned()
        .collect()
}
