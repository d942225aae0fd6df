// src/external/mod.rs

pub mod artifact;
pub mod chimera;
pub mod msa;

pub use artifact::SortMeRnaFilter;
pub use chimera::VsearchChimeraFilter;
pub use msa::MafftAligner;

use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::process::Command;

use crate::errors::{DeblurError, Result};
use crate::types::FastaRecord;

/// Reference-based filtering of non-biological artifact sequences.
/// Sequences in, surviving sequences out; `negate` inverts the match so
/// that database hits are discarded instead of kept. `scratch_dir` must
/// be private to the call: concurrent invocations over different
/// samples each get their own.
pub trait ArtifactFilter: Sync {
    fn filter(
        &self,
        seqs: &[FastaRecord],
        negate: bool,
        threads: usize,
        scratch_dir: &Path,
    ) -> Result<Vec<FastaRecord>>;
}

/// Multiple sequence alignment. Output records correspond to the input
/// records and all share one aligned length.
pub trait Aligner: Sync {
    fn align(&self, seqs: &[FastaRecord]) -> Result<Vec<FastaRecord>>;
}

/// De-novo chimera detection over aligned sequences; returns the
/// non-chimeric subset.
pub trait ChimeraFilter: Sync {
    fn detect_and_remove(&self, aligned: &[FastaRecord]) -> Result<Vec<FastaRecord>>;
}

/// Caller-supplied budget for external-tool threads, shared by every
/// sample pipeline. Acquisition blocks until enough threads are free,
/// so cross-sample parallelism never multiplies the tool thread count.
#[derive(Debug)]
pub struct ThreadBudget {
    total: usize,
    available: Mutex<usize>,
    freed: Condvar,
}

impl ThreadBudget {
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        Self { total, available: Mutex::new(total), freed: Condvar::new() }
    }

    /// Blocks until `want` threads (clamped to the budget total) are
    /// free and leases them until the returned guard drops.
    pub fn acquire(&self, want: usize) -> ThreadLease<'_> {
        let want = want.clamp(1, self.total);
        let mut available = self.available.lock();
        while *available < want {
            self.freed.wait(&mut available);
        }
        *available -= want;
        ThreadLease { budget: self, leased: want }
    }
}

/// Leased external-tool threads; returned to the budget on drop.
pub struct ThreadLease<'a> {
    budget: &'a ThreadBudget,
    leased: usize,
}

impl ThreadLease<'_> {
    pub fn threads(&self) -> usize {
        self.leased
    }
}

impl Drop for ThreadLease<'_> {
    fn drop(&mut self) {
        let mut available = self.budget.available.lock();
        *available += self.leased;
        self.budget.freed.notify_all();
    }
}

/// Runs a blocking external command, mapping spawn failures and
/// non-zero exits to `ExternalTool` errors. There is no retry.
pub(crate) fn run_tool(tool: &str, cmd: &mut Command) -> Result<std::process::Output> {
    log::debug!("running {tool}: {cmd:?}");
    let output = cmd
        .output()
        .map_err(|e| DeblurError::tool(tool, format!("failed to spawn: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeblurError::tool(
            tool,
            format!("exited with {}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(output)
}
