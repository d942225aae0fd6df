// src/workflow.rs

use ahash::AHashMap;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::denoise::denoise;
use crate::error_model::ErrorProfile;
use crate::errors::{DeblurError, Result};
use crate::external::{
    Aligner, ArtifactFilter, ChimeraFilter, MafftAligner, SortMeRnaFilter, ThreadBudget,
    VsearchChimeraFilter,
};
use crate::fasta::{read_fasta_records, write_fasta_records};
use crate::feature_table::{build_table, merge_tables, write_biom_table, FeatureTable};
use crate::seq_table::{
    dereplicate, format_derep_map, format_size_annotation, trim_seqs, DEFAULT_MIN_SIZE,
};
use crate::types::{DereplicationMap, FastaRecord, SequenceRecord, SequenceTable};
use crate::WorkflowResults;

/// Options for one full pipeline run.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Demultiplexed multi-sample FASTA (plain or .gz)
    pub seqs_fp: PathBuf,
    /// Output directory; receives the BIOM table, the representative
    /// sequence FASTA, and (optionally) the dereplication map
    pub output_fp: PathBuf,
    /// Reference FASTA databases for artifact filtering
    pub ref_fps: Vec<PathBuf>,
    /// Prebuilt indexes, one per reference, in the same order
    pub ref_db_fps: Vec<PathBuf>,
    pub read_error: f64,
    pub mean_error: Option<f64>,
    pub error_dist: Option<Vec<f64>>,
    pub indel_prob: f64,
    pub indel_max: usize,
    pub trim_length: usize,
    pub min_size: u64,
    /// Discard (rather than keep) database hits
    pub negate: bool,
    /// Thread budget for external tools, shared across samples
    pub threads: usize,
    /// Separates the sample id prefix from the rest of a read label
    pub delim: String,
    pub overwrite: bool,
    pub keep_tmp_files: bool,
    /// Also write the UC-style dereplication map
    pub output_map: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            seqs_fp: PathBuf::new(),
            output_fp: PathBuf::new(),
            ref_fps: Vec::new(),
            ref_db_fps: Vec::new(),
            read_error: 0.05,
            mean_error: None,
            error_dist: None,
            indel_prob: 0.01,
            indel_max: 3,
            trim_length: 100,
            min_size: DEFAULT_MIN_SIZE,
            negate: false,
            threads: 1,
            delim: "_".to_string(),
            overwrite: false,
            keep_tmp_files: false,
            output_map: false,
        }
    }
}

/// Removes the working directory (generated indexes included) when
/// dropped, so cleanup happens on every exit path. `keep` disables the
/// removal for debugging.
pub struct WorkdirGuard {
    path: PathBuf,
    keep: bool,
}

impl WorkdirGuard {
    pub fn create(path: PathBuf, keep: bool) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, keep })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if self.keep {
            log::info!("keeping temporary files under {}", self.path.display());
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            log::warn!("could not remove working directory {}: {e}", self.path.display());
        }
    }
}

/// Groups reads by the sample id prefix of their labels. Reads without
/// a delimiter fall into a sample named after their whole label.
pub fn split_sequence_file_on_sample_ids(
    reads: &[FastaRecord],
    delimiter: &str,
) -> AHashMap<String, Vec<FastaRecord>> {
    let mut by_sample: AHashMap<String, Vec<FastaRecord>> = AHashMap::new();
    for read in reads {
        by_sample
            .entry(read.sample_id(delimiter).to_string())
            .or_default()
            .push(read.clone());
    }
    by_sample
}

/// Output of one sample's pipeline.
#[derive(Debug)]
pub struct SampleResult {
    pub table: FeatureTable,
    pub derep_map: DereplicationMap,
}

/// Runs the per-sample stages: trim, dereplicate, artifact filter,
/// align, chimera filter, denoise, aggregate. Any stage error aborts
/// only this sample. `scratch_dir` must belong to this sample alone;
/// the artifact filter writes its intermediates there.
pub fn run_sample_pipeline(
    sample_id: &str,
    reads: &[FastaRecord],
    config: &WorkflowConfig,
    profile: &ErrorProfile,
    artifact_filter: &dyn ArtifactFilter,
    aligner: &dyn Aligner,
    chimera_filter: &dyn ChimeraFilter,
    scratch_dir: &Path,
) -> Result<SampleResult> {
    log::info!("sample {sample_id}: trimming {} reads to {}", reads.len(), config.trim_length);
    let trimmed = trim_seqs(reads, config.trim_length);
    if trimmed.is_empty() {
        return Err(DeblurError::empty("trim"));
    }

    log::info!("sample {sample_id}: dereplicating {} reads", trimmed.len());
    let (table, derep_map) = dereplicate(&trimmed, config.min_size);
    if table.is_empty() {
        return Err(DeblurError::empty("dereplicate"));
    }

    // Unique sequences travel through the external tools labeled by
    // their first originating read (unique per cluster) plus a ;size=
    // abundance annotation; chimera detection votes by abundance.
    let mut uniques: Vec<FastaRecord> = table
        .values()
        .map(|rec| FastaRecord::new(annotated_label(rec), rec.sequence.clone()))
        .collect();
    uniques.sort_by(|a, b| a.label.cmp(&b.label));
    let by_label: AHashMap<String, &SequenceRecord> =
        table.values().map(|rec| (annotated_label(rec), rec)).collect();

    log::info!("sample {sample_id}: filtering artifacts across {} uniques", uniques.len());
    let surviving =
        artifact_filter.filter(&uniques, config.negate, config.threads, scratch_dir)?;
    if surviving.is_empty() {
        return Err(DeblurError::empty("filter-artifacts"));
    }

    log::info!("sample {sample_id}: aligning {} sequences", surviving.len());
    let aligned = aligner.align(&surviving)?;

    log::info!("sample {sample_id}: removing chimeras");
    let non_chimeric = chimera_filter.detect_and_remove(&aligned)?;
    if non_chimeric.is_empty() {
        return Err(DeblurError::empty("remove-chimeras"));
    }

    // Re-key the table by aligned sequence; abundances and labels carry
    // over from the dereplicated records.
    let mut aligned_table: SequenceTable = AHashMap::new();
    for rec in &non_chimeric {
        let Some(source) = by_label.get(&rec.label) else {
            return Err(DeblurError::tool(
                "msa",
                format!("alignment returned unknown label '{}'", rec.label),
            ));
        };
        aligned_table.insert(
            rec.sequence.clone(),
            SequenceRecord {
                sequence: rec.sequence.clone(),
                abundance: source.abundance,
                labels: source.labels.clone(),
            },
        );
    }

    log::info!("sample {sample_id}: denoising {} sequences", aligned_table.len());
    let denoised = denoise(&aligned_table, profile);
    let degapped = degap_table(&denoised);
    if degapped.is_empty() {
        return Err(DeblurError::empty("denoise"));
    }

    let derep_for_output: DereplicationMap =
        degapped.iter().map(|(seq, rec)| (seq.clone(), rec.labels.clone())).collect();
    let table = build_table(&degapped, &derep_for_output, &config.delim)?;

    Ok(SampleResult { table, derep_map })
}

fn cluster_label(rec: &SequenceRecord) -> String {
    let mut labels: Vec<&String> = rec.labels.iter().collect();
    labels.sort();
    labels
        .first()
        .map(|l| l.to_string())
        .unwrap_or_else(|| rec.sequence.clone())
}

fn annotated_label(rec: &SequenceRecord) -> String {
    format_size_annotation(&cluster_label(rec), rec.abundance)
}

/// Strips alignment gaps from the denoised sequences. Distinct aligned
/// sequences that collapse to one string after degapping are merged,
/// summing abundances.
pub fn degap_table(table: &SequenceTable) -> SequenceTable {
    let mut out: SequenceTable = AHashMap::new();
    for rec in table.values() {
        let degapped: String = rec.sequence.chars().filter(|&c| c != '-').collect();
        if degapped.is_empty() {
            continue;
        }
        let entry = out.entry(degapped.clone()).or_insert_with(|| SequenceRecord {
            sequence: degapped,
            abundance: 0.0,
            labels: Vec::new(),
        });
        entry.abundance += rec.abundance;
        entry.labels.extend(rec.labels.iter().cloned());
    }
    out
}

/// Runs the whole pipeline: split by sample, per-sample stages in a
/// worker pool, merge, and write the outputs. A failed sample is
/// reported and excluded from the merge; configuration problems and
/// output conflicts are fatal before any work starts.
pub fn run_workflow(config: &WorkflowConfig) -> Result<WorkflowResults> {
    // Fatal startup validation: profile, references, output conflict
    let profile = ErrorProfile::build(
        config.read_error,
        config.mean_error,
        config.error_dist.clone(),
        config.indel_prob,
        config.indel_max,
        Some(config.trim_length),
    )?;
    let workdir_path = config.output_fp.join("deblur_working_dir");
    let budget = Arc::new(ThreadBudget::new(config.threads));
    let artifact_filter = SortMeRnaFilter::new(
        config.ref_fps.clone(),
        config.ref_db_fps.clone(),
        workdir_path.join("indexes"),
        budget.clone(),
    )?;
    if config.output_fp.exists() && !config.overwrite {
        return Err(DeblurError::ResourceConflict {
            path: config.output_fp.display().to_string(),
        });
    }
    std::fs::create_dir_all(&config.output_fp)?;
    let workdir = WorkdirGuard::create(workdir_path, config.keep_tmp_files)?;
    // Generated indexes are built once, before the sample pipelines
    // can race over them
    artifact_filter.prepare_indexes()?;

    let reads = read_fasta_records(&config.seqs_fp)?;
    if reads.is_empty() {
        return Err(DeblurError::empty("split"));
    }
    let by_sample = split_sequence_file_on_sample_ids(&reads, &config.delim);
    let mut sample_ids: Vec<String> = by_sample.keys().cloned().collect();
    sample_ids.sort();
    log::info!("processing {} samples from {}", sample_ids.len(), config.seqs_fp.display());

    let outcomes: Vec<(String, Result<SampleResult>)> = sample_ids
        .par_iter()
        .map(|sample_id| {
            let sample_workdir = workdir.path().join(sample_id);
            let aligner = MafftAligner::new(sample_workdir.clone(), budget.clone(), config.threads);
            let chimera_filter =
                VsearchChimeraFilter::new(sample_workdir.clone(), budget.clone(), config.threads);
            let result = run_sample_pipeline(
                sample_id,
                &by_sample[sample_id],
                config,
                &profile,
                &artifact_filter,
                &aligner,
                &chimera_filter,
                &sample_workdir,
            );
            (sample_id.clone(), result)
        })
        .collect();

    let mut tables = Vec::new();
    let mut derep_text = String::new();
    let mut failed_samples = Vec::new();
    for (sample_id, outcome) in outcomes {
        match outcome {
            Ok(result) => {
                if config.output_map {
                    derep_text.push_str(&format_derep_map(&result.derep_map));
                }
                tables.push(result.table);
            }
            Err(e) => {
                log::warn!("sample {sample_id} failed and is excluded from the merge: {e}");
                failed_samples.push(sample_id);
            }
        }
    }

    let merged = merge_tables(tables);
    let results = WorkflowResults {
        table: merged,
        failed_samples,
        derep_map_text: config.output_map.then_some(derep_text),
    };
    write_outputs(&config.output_fp, &results)?;
    Ok(results)
}

/// Writes the merged outputs; the single-writer step after all samples
/// finish. Rejects an empty merged table.
fn write_outputs(output_fp: &Path, results: &WorkflowResults) -> Result<()> {
    write_biom_table(output_fp.join("all.biom"), &results.table)?;
    write_fasta_records(output_fp.join("all.seqs.fa"), &results.rep_seq_records())?;
    if let Some(text) = &results.derep_map_text {
        std::fs::write(output_fp.join("all.derep.uc"), text)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::artifact::apply_matches;
    use ahash::AHashSet;

    struct PassThroughArtifacts;
    impl ArtifactFilter for PassThroughArtifacts {
        fn filter(
            &self,
            seqs: &[FastaRecord],
            negate: bool,
            _threads: usize,
            _scratch_dir: &Path,
        ) -> Result<Vec<FastaRecord>> {
            // Everything "matches" the reference
            let all: AHashSet<String> = seqs.iter().map(|r| r.label.clone()).collect();
            Ok(apply_matches(seqs, &all, negate))
        }
    }

    /// Writes its input into the scratch directory, waits for the other
    /// pipelines to do the same, then reads it back. Surfaces any
    /// cross-sample clobbering of the scratch files as lost sequences.
    struct ScratchFileArtifacts;
    impl ArtifactFilter for ScratchFileArtifacts {
        fn filter(
            &self,
            seqs: &[FastaRecord],
            _negate: bool,
            _threads: usize,
            scratch_dir: &Path,
        ) -> Result<Vec<FastaRecord>> {
            std::fs::create_dir_all(scratch_dir)?;
            let input_fp = scratch_dir.join("input.fa");
            crate::fasta::write_fasta_records(&input_fp, seqs)?;
            std::thread::sleep(std::time::Duration::from_millis(20));
            crate::fasta::read_fasta_records(&input_fp)
        }
    }

    struct IdentityAligner;
    impl Aligner for IdentityAligner {
        fn align(&self, seqs: &[FastaRecord]) -> Result<Vec<FastaRecord>> {
            Ok(seqs.to_vec())
        }
    }

    struct NoChimeras;
    impl ChimeraFilter for NoChimeras {
        fn detect_and_remove(&self, aligned: &[FastaRecord]) -> Result<Vec<FastaRecord>> {
            Ok(aligned.to_vec())
        }
    }

    struct RecordingChimeras {
        seen_labels: parking_lot::Mutex<Vec<String>>,
    }
    impl ChimeraFilter for RecordingChimeras {
        fn detect_and_remove(&self, aligned: &[FastaRecord]) -> Result<Vec<FastaRecord>> {
            let mut seen = self.seen_labels.lock();
            seen.extend(aligned.iter().map(|r| r.label.clone()));
            Ok(aligned.to_vec())
        }
    }

    struct FailingAligner;
    impl Aligner for FailingAligner {
        fn align(&self, _seqs: &[FastaRecord]) -> Result<Vec<FastaRecord>> {
            Err(DeblurError::tool("mafft", "exited with status 1"))
        }
    }

    fn config() -> WorkflowConfig {
        WorkflowConfig {
            error_dist: Some(vec![1.0, 0.02]),
            trim_length: 4,
            ..WorkflowConfig::default()
        }
    }

    fn profile(config: &WorkflowConfig) -> ErrorProfile {
        ErrorProfile::build(
            config.read_error,
            config.mean_error,
            config.error_dist.clone(),
            config.indel_prob,
            config.indel_max,
            Some(config.trim_length),
        )
        .unwrap()
    }

    fn reads_with_counts(specs: &[(&str, &str, usize)]) -> Vec<FastaRecord> {
        let mut reads = Vec::new();
        for (sample, seq, count) in specs {
            for i in 0..*count {
                reads.push(FastaRecord::new(format!("{sample}_{seq}_{i}"), *seq));
            }
        }
        reads
    }

    #[test]
    fn test_split_on_sample_ids() {
        let reads = vec![
            FastaRecord::new("s1_0", "ACGT"),
            FastaRecord::new("s2_0", "TTTT"),
            FastaRecord::new("s1_1", "ACGT"),
        ];
        let by_sample = split_sequence_file_on_sample_ids(&reads, "_");
        assert_eq!(by_sample.len(), 2);
        assert_eq!(by_sample["s1"].len(), 2);
        assert_eq!(by_sample["s2"].len(), 1);
    }

    #[test]
    fn test_sample_pipeline_end_to_end() {
        let cfg = config();
        let prof = profile(&cfg);
        // 100 AAAA reads and 5 AAAT reads: denoising explains 2 of the
        // AAAT reads away (100 * 0.02), leaving 3
        let reads = reads_with_counts(&[("s1", "AAAA", 100), ("s1", "AAAT", 5)]);
        let scratch = tempfile::tempdir().unwrap();
        let result = run_sample_pipeline(
            "s1",
            &reads,
            &cfg,
            &prof,
            &PassThroughArtifacts,
            &IdentityAligner,
            &NoChimeras,
            scratch.path(),
        )
        .unwrap();

        let entries = result.table.entries();
        assert_eq!(entries.len(), 2);
        let by_seq: AHashMap<&str, f64> =
            entries.iter().map(|(_, q, a)| (q.as_str(), *a)).collect();
        assert_eq!(by_seq["AAAA"], 100.0);
        assert_eq!(by_seq["AAAT"], 3.0);
    }

    #[test]
    fn test_sample_pipeline_fails_on_empty_trim() {
        let cfg = config();
        let prof = profile(&cfg);
        let reads = vec![FastaRecord::new("s1_0", "AC")]; // too short
        let scratch = tempfile::tempdir().unwrap();
        let err = run_sample_pipeline(
            "s1",
            &reads,
            &cfg,
            &prof,
            &PassThroughArtifacts,
            &IdentityAligner,
            &NoChimeras,
            scratch.path(),
        )
        .unwrap_err();
        assert!(matches!(err, DeblurError::EmptyResult { .. }));
    }

    #[test]
    fn test_sample_pipeline_surfaces_tool_failure() {
        let cfg = config();
        let prof = profile(&cfg);
        let reads = reads_with_counts(&[("s1", "AAAA", 10)]);
        let scratch = tempfile::tempdir().unwrap();
        let err = run_sample_pipeline(
            "s1",
            &reads,
            &cfg,
            &prof,
            &PassThroughArtifacts,
            &FailingAligner,
            &NoChimeras,
            scratch.path(),
        )
        .unwrap_err();
        assert!(matches!(err, DeblurError::ExternalTool { .. }));
    }

    #[test]
    fn test_parallel_samples_keep_separate_scratch_dirs() {
        let cfg = config();
        let prof = profile(&cfg);
        let workdir = tempfile::tempdir().unwrap();
        let filter = ScratchFileArtifacts;

        let samples = vec![
            ("sA", reads_with_counts(&[("sA", "AAAA", 10), ("sA", "CCCC", 10)])),
            ("sB", reads_with_counts(&[("sB", "GGGG", 10), ("sB", "TTTT", 10)])),
        ];
        let outcomes: Vec<Result<SampleResult>> = samples
            .par_iter()
            .map(|(sample_id, reads)| {
                run_sample_pipeline(
                    sample_id,
                    reads,
                    &cfg,
                    &prof,
                    &filter,
                    &IdentityAligner,
                    &NoChimeras,
                    &workdir.path().join(sample_id),
                )
            })
            .collect();

        // Each sample keeps both of its sequences; with a shared
        // scratch file one pipeline's input would clobber the other's
        for outcome in outcomes {
            let result = outcome.unwrap();
            assert_eq!(result.table.sequences().len(), 2);
        }
    }

    #[test]
    fn test_chimera_stage_receives_abundance_annotations() {
        let cfg = config();
        let prof = profile(&cfg);
        let reads = reads_with_counts(&[("s1", "AAAA", 100), ("s1", "AAAT", 5)]);
        let chimeras = RecordingChimeras { seen_labels: parking_lot::Mutex::new(Vec::new()) };
        let scratch = tempfile::tempdir().unwrap();
        run_sample_pipeline(
            "s1",
            &reads,
            &cfg,
            &prof,
            &PassThroughArtifacts,
            &IdentityAligner,
            &chimeras,
            scratch.path(),
        )
        .unwrap();

        let seen = chimeras.seen_labels.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&"s1_AAAA_0;size=100".to_string()));
        assert!(seen.contains(&"s1_AAAT_0;size=5".to_string()));
    }

    #[test]
    fn test_degap_merges_collapsing_sequences() {
        let mut table: SequenceTable = AHashMap::new();
        for (seq, abundance) in [("AC-GT", 5.0), ("ACG-T", 3.0)] {
            table.insert(
                seq.to_string(),
                SequenceRecord {
                    sequence: seq.to_string(),
                    abundance,
                    labels: vec![format!("{seq}_r")],
                },
            );
        }
        let degapped = degap_table(&table);
        assert_eq!(degapped.len(), 1);
        assert_eq!(degapped["ACGT"].abundance, 8.0);
        assert_eq!(degapped["ACGT"].labels.len(), 2);
    }

    #[test]
    fn test_workdir_guard_removes_unless_kept() {
        let dir = tempfile::tempdir().unwrap();

        let removed = dir.path().join("wd_removed");
        {
            let guard = WorkdirGuard::create(removed.clone(), false).unwrap();
            std::fs::write(guard.path().join("scratch.idx"), b"x").unwrap();
        }
        assert!(!removed.exists());

        let kept = dir.path().join("wd_kept");
        {
            let _guard = WorkdirGuard::create(kept.clone(), true).unwrap();
        }
        assert!(kept.exists());
    }

    #[test]
    fn test_workflow_rejects_existing_output_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let output_fp = dir.path().join("out");
        std::fs::create_dir_all(&output_fp).unwrap();

        let cfg = WorkflowConfig {
            seqs_fp: dir.path().join("missing.fa"),
            output_fp,
            ref_fps: vec![dir.path().join("ref.fa")],
            ..config()
        };
        let err = run_workflow(&cfg).unwrap_err();
        assert!(matches!(err, DeblurError::ResourceConflict { .. }));
    }

    #[test]
    fn test_workflow_rejects_ref_index_mismatch_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WorkflowConfig {
            seqs_fp: dir.path().join("missing.fa"),
            output_fp: dir.path().join("out"),
            ref_fps: vec![dir.path().join("a.fa"), dir.path().join("b.fa")],
            ref_db_fps: vec![dir.path().join("a.idx")],
            ..config()
        };
        let err = run_workflow(&cfg).unwrap_err();
        assert!(matches!(err, DeblurError::Config { .. }));
    }
}
