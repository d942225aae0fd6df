use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

use deblur_rs::denoise::denoise;
use deblur_rs::error_model::ErrorProfile;
use deblur_rs::errors::{DeblurError, Result};
use deblur_rs::external::{
    Aligner, ArtifactFilter, ChimeraFilter, MafftAligner, SortMeRnaFilter, ThreadBudget,
    VsearchChimeraFilter,
};
use deblur_rs::fasta::{read_fasta_records, write_fasta_records};
use deblur_rs::feature_table::{build_table, write_biom_table};
use deblur_rs::seq_table::{
    dereplicate, format_derep_map, format_size_annotation, parse_size_annotation, trim_seqs,
};
use deblur_rs::types::{FastaRecord, SequenceRecord, SequenceTable};
use deblur_rs::workflow::{run_workflow, WorkdirGuard, WorkflowConfig};

#[derive(Parser)]
#[command(name = "deblur-rs")]
#[command(version)]
#[command(about = "Denoise amplicon reads into a per-sample feature table", long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trim reads to a fixed length, dropping shorter ones
    Trim {
        /// Input FASTA (plain or .gz)
        #[arg(long)]
        seqs_fp: PathBuf,
        /// Output FASTA
        #[arg(long)]
        output_fp: PathBuf,
        /// Sequence trim length
        #[arg(short, long, default_value = "100")]
        trim_length: usize,
    },

    /// Collapse identical reads, dropping clusters under min-size
    Dereplicate {
        #[arg(long)]
        seqs_fp: PathBuf,
        /// Output FASTA with ;size= abundance annotations
        #[arg(long)]
        output_fp: PathBuf,
        /// Discard sequences with an abundance smaller than this
        #[arg(long, default_value = "2")]
        min_size: u64,
        /// Also write a UC-style dereplication map here
        #[arg(long)]
        map_fp: Option<PathBuf>,
    },

    /// Keep (or with --negate discard) sequences matching a reference
    FilterArtifacts {
        #[arg(long)]
        seqs_fp: PathBuf,
        #[arg(long)]
        output_fp: PathBuf,
        /// Reference FASTA database(s)
        #[arg(long, required = true)]
        ref_fp: Vec<PathBuf>,
        /// Prebuilt index per reference, same order as --ref-fp
        #[arg(long)]
        ref_db_fp: Vec<PathBuf>,
        /// Discard database hits instead of keeping them
        #[arg(short, long)]
        negate: bool,
        #[arg(short = 'a', long, default_value = "1")]
        threads: usize,
        /// Working directory for generated indexes and tool output
        #[arg(long, default_value = "deblur_working_dir")]
        tmp_dir: PathBuf,
        /// Keep the working directory afterwards
        #[arg(long)]
        keep_tmp_files: bool,
    },

    /// Multiple-sequence-align reads
    Align {
        #[arg(long)]
        seqs_fp: PathBuf,
        #[arg(long)]
        output_fp: PathBuf,
        #[arg(short = 'a', long, default_value = "1")]
        threads: usize,
        #[arg(long, default_value = "deblur_working_dir")]
        tmp_dir: PathBuf,
        #[arg(long)]
        keep_tmp_files: bool,
    },

    /// Remove de-novo chimeras from aligned reads
    RemoveChimeras {
        #[arg(long)]
        seqs_fp: PathBuf,
        #[arg(long)]
        output_fp: PathBuf,
        #[arg(short = 'a', long, default_value = "1")]
        threads: usize,
        #[arg(long, default_value = "deblur_working_dir")]
        tmp_dir: PathBuf,
        #[arg(long)]
        keep_tmp_files: bool,
    },

    /// Denoise a dereplicated (;size= annotated) FASTA
    Denoise {
        #[arg(long)]
        seqs_fp: PathBuf,
        #[arg(long)]
        output_fp: PathBuf,
        /// Read error rate
        #[arg(short = 'e', long, default_value = "0.05")]
        read_error: f64,
        /// Mean error used for the original-sequence estimate
        #[arg(short = 'm', long)]
        mean_error: Option<f64>,
        /// Comma-separated per-Hamming-distance error probabilities
        #[arg(short = 'd', long)]
        error_dist: Option<String>,
        /// Insertion/deletion probability (same for N indels)
        #[arg(short = 'i', long, default_value = "0.01")]
        indel_prob: f64,
        /// Maximal indel number
        #[arg(long, default_value = "3")]
        indel_max: usize,
        /// Trim length the reads were cut to (for the derived profile)
        #[arg(short, long, default_value = "100")]
        trim_length: usize,
    },

    /// Build a BIOM table from a denoised (;size= annotated) FASTA
    BuildTable {
        #[arg(long)]
        seqs_fp: PathBuf,
        /// Output BIOM (JSON) filepath
        #[arg(long)]
        output_fp: PathBuf,
        /// Delimiter separating the sample id prefix in read labels
        #[arg(long, default_value = "_")]
        delim: String,
    },

    /// Run the full per-sample pipeline and merge the results
    Workflow {
        /// Demultiplexed FASTA including all samples
        #[arg(long)]
        seqs_fp: PathBuf,
        /// Output directory
        #[arg(long)]
        output_fp: PathBuf,
        #[arg(long, required = true)]
        ref_fp: Vec<PathBuf>,
        #[arg(long)]
        ref_db_fp: Vec<PathBuf>,
        #[arg(short = 'e', long, default_value = "0.05")]
        read_error: f64,
        #[arg(short = 'm', long)]
        mean_error: Option<f64>,
        #[arg(short = 'd', long)]
        error_dist: Option<String>,
        #[arg(short = 'i', long, default_value = "0.01")]
        indel_prob: f64,
        #[arg(long, default_value = "3")]
        indel_max: usize,
        #[arg(short, long, default_value = "100")]
        trim_length: usize,
        #[arg(long, default_value = "2")]
        min_size: u64,
        #[arg(short, long)]
        negate: bool,
        #[arg(short = 'a', long, default_value = "1")]
        threads: usize,
        #[arg(long, default_value = "_")]
        delim: String,
        /// Overwrite an existing output directory
        #[arg(short = 'w', long)]
        overwrite: bool,
        #[arg(long)]
        keep_tmp_files: bool,
        /// Also write the UC-style dereplication map
        #[arg(long)]
        output_map: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new().parse_filters(&cli.log_level).init();

    if let Err(e) = run(cli.command) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Trim { seqs_fp, output_fp, trim_length } => {
            let reads = read_fasta_records(&seqs_fp)?;
            let trimmed = trim_seqs(&reads, trim_length);
            log::info!("kept {} of {} reads at length {trim_length}", trimmed.len(), reads.len());
            write_fasta_records(&output_fp, &trimmed)
        }

        Commands::Dereplicate { seqs_fp, output_fp, min_size, map_fp } => {
            let reads = read_fasta_records(&seqs_fp)?;
            let (table, derep_map) = dereplicate(&reads, min_size);
            write_fasta_records(&output_fp, &annotated_records(&table))?;
            if let Some(map_fp) = map_fp {
                std::fs::write(map_fp, format_derep_map(&derep_map))?;
            }
            log::info!("{} unique sequences at min-size {min_size}", table.len());
            Ok(())
        }

        Commands::FilterArtifacts {
            seqs_fp,
            output_fp,
            ref_fp,
            ref_db_fp,
            negate,
            threads,
            tmp_dir,
            keep_tmp_files,
        } => {
            let budget = Arc::new(ThreadBudget::new(threads));
            let workdir = WorkdirGuard::create(tmp_dir, keep_tmp_files)?;
            let filter =
                SortMeRnaFilter::new(ref_fp, ref_db_fp, workdir.path().join("indexes"), budget)?;
            filter.prepare_indexes()?;
            let reads = read_fasta_records(&seqs_fp)?;
            let surviving = filter.filter(&reads, negate, threads, workdir.path())?;
            log::info!("{} of {} sequences survived artifact filtering", surviving.len(), reads.len());
            write_fasta_records(&output_fp, &surviving)
        }

        Commands::Align { seqs_fp, output_fp, threads, tmp_dir, keep_tmp_files } => {
            let budget = Arc::new(ThreadBudget::new(threads));
            let workdir = WorkdirGuard::create(tmp_dir, keep_tmp_files)?;
            let aligner = MafftAligner::new(workdir.path().to_path_buf(), budget, threads);
            let reads = read_fasta_records(&seqs_fp)?;
            let aligned = aligner.align(&reads)?;
            write_fasta_records(&output_fp, &aligned)
        }

        Commands::RemoveChimeras { seqs_fp, output_fp, threads, tmp_dir, keep_tmp_files } => {
            let budget = Arc::new(ThreadBudget::new(threads));
            let workdir = WorkdirGuard::create(tmp_dir, keep_tmp_files)?;
            let filter = VsearchChimeraFilter::new(workdir.path().to_path_buf(), budget, threads);
            let reads = read_fasta_records(&seqs_fp)?;
            let non_chimeric = filter.detect_and_remove(&reads)?;
            log::info!("{} of {} sequences are non-chimeric", non_chimeric.len(), reads.len());
            write_fasta_records(&output_fp, &non_chimeric)
        }

        Commands::Denoise {
            seqs_fp,
            output_fp,
            read_error,
            mean_error,
            error_dist,
            indel_prob,
            indel_max,
            trim_length,
        } => {
            let profile = ErrorProfile::build(
                read_error,
                mean_error,
                error_dist.as_deref().map(parse_error_dist).transpose()?,
                indel_prob,
                indel_max,
                Some(trim_length),
            )?;
            let reads = read_fasta_records(&seqs_fp)?;
            let table = annotated_table(&reads);
            let denoised = denoise(&table, &profile);
            log::info!("{} of {} sequences survived denoising", denoised.len(), table.len());
            write_fasta_records(&output_fp, &annotated_records(&denoised))
        }

        Commands::BuildTable { seqs_fp, output_fp, delim } => {
            let reads = read_fasta_records(&seqs_fp)?;
            let table = annotated_table(&reads);
            let derep_map =
                table.iter().map(|(s, r)| (s.clone(), r.labels.clone())).collect();
            let feature_table = build_table(&table, &derep_map, &delim)?;
            write_biom_table(&output_fp, &feature_table)
        }

        Commands::Workflow {
            seqs_fp,
            output_fp,
            ref_fp,
            ref_db_fp,
            read_error,
            mean_error,
            error_dist,
            indel_prob,
            indel_max,
            trim_length,
            min_size,
            negate,
            threads,
            delim,
            overwrite,
            keep_tmp_files,
            output_map,
        } => {
            let config = WorkflowConfig {
                seqs_fp,
                output_fp: output_fp.clone(),
                ref_fps: ref_fp,
                ref_db_fps: ref_db_fp,
                read_error,
                mean_error,
                error_dist: error_dist.as_deref().map(parse_error_dist).transpose()?,
                indel_prob,
                indel_max,
                trim_length,
                min_size,
                negate,
                threads,
                delim,
                overwrite,
                keep_tmp_files,
                output_map,
            };

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg}")
                    .expect("Invalid spinner template"),
            );
            spinner.set_message("Running deblur workflow...");
            spinner.enable_steady_tick(std::time::Duration::from_millis(100));

            let results = run_workflow(&config)?;

            spinner.finish_with_message(format!(
                "Done: {} sequences across {} samples ({} failed)",
                results.table.sequences().len(),
                results.table.sample_ids().len(),
                results.failed_samples.len(),
            ));
            for sample in &results.failed_samples {
                log::warn!("sample {sample} was excluded from the merged table");
            }
            log::info!("outputs written to {}", output_fp.display());
            Ok(())
        }
    }
}

/// Comma-separated probability list for --error-dist.
fn parse_error_dist(raw: &str) -> Result<Vec<f64>> {
    raw.split(',')
        .map(|tok| {
            tok.trim().parse::<f64>().map_err(|_| {
                DeblurError::config("error-dist", format!("'{tok}' is not a number"))
            })
        })
        .collect()
}

/// Reads a ;size= annotated FASTA into a sequence table.
fn annotated_table(reads: &[FastaRecord]) -> SequenceTable {
    let mut table = SequenceTable::new();
    for rec in reads {
        let (base, abundance) = parse_size_annotation(&rec.label);
        let entry = table.entry(rec.sequence.clone()).or_insert_with(|| SequenceRecord {
            sequence: rec.sequence.clone(),
            abundance: 0.0,
            labels: Vec::new(),
        });
        entry.abundance += abundance;
        entry.labels.push(base.to_string());
    }
    table
}

/// Renders a sequence table as ;size= annotated records, most abundant
/// first.
fn annotated_records(table: &SequenceTable) -> Vec<FastaRecord> {
    let mut recs: Vec<&SequenceRecord> = table.values().collect();
    recs.sort_by(|a, b| {
        b.abundance
            .partial_cmp(&a.abundance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
    recs.iter()
        .map(|rec| {
            let mut labels: Vec<&String> = rec.labels.iter().collect();
            labels.sort();
            let base = labels.first().map(|l| l.as_str()).unwrap_or(rec.sequence.as_str());
            FastaRecord::new(format_size_annotation(base, rec.abundance), rec.sequence.clone())
        })
        .collect()
}
