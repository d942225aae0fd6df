// src/denoise.rs

use std::cmp::Ordering;

use crate::error_model::ErrorProfile;
use crate::types::{SequenceRecord, SequenceTable};

/// Substitution/indel breakdown of one aligned sequence pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedDistance {
    /// Positions where both sequences carry a base and they differ
    pub substitutions: usize,
    /// Positions where exactly one sequence carries a gap
    pub indels: usize,
}

/// Column-wise distance between two equal-length (aligned) sequences.
/// Returns `None` for unequal lengths; such pairs are not comparable
/// and have no explanatory effect on each other.
pub fn aligned_distance(a: &str, b: &str) -> Option<AlignedDistance> {
    if a.len() != b.len() {
        return None;
    }
    let mut substitutions = 0;
    let mut indels = 0;
    for (ca, cb) in a.bytes().zip(b.bytes()) {
        if ca == cb {
            continue;
        }
        if ca == b'-' || cb == b'-' {
            indels += 1;
        } else {
            substitutions += 1;
        }
    }
    Some(AlignedDistance { substitutions, indels })
}

/// A candidate whose expected distance-1 output falls below this many
/// reads cannot meaningfully explain any neighbor and is skipped as an
/// explainer.
pub const MIN_EXPLAINED_READS: f64 = 0.1;

/// Removes reads explainable as sequencing-error byproducts of a more
/// abundant sequence.
///
/// One pass over the table in abundance-descending order (ties broken
/// by sequence string, so reruns are reproducible). Each candidate true
/// sequence, at its current working abundance, subtracts the error
/// mass it is expected to shed onto every in-range neighbor: the
/// Hamming band for pure-substitution neighbors, the coarse indel band
/// for anything with at least one indel. Working abundances are floored
/// at 0; a candidate already at 0 (or below the
/// [`MIN_EXPLAINED_READS`] cutoff) no longer explains anyone.
/// Sequences finishing at 0 are dropped from the result.
///
/// Later, lower-abundance sequences never reclaim mass removed by an
/// earlier explainer; the single pass trades correction completeness
/// for determinism.
pub fn denoise(table: &SequenceTable, profile: &ErrorProfile) -> SequenceTable {
    let mut ranked: Vec<&SequenceRecord> = table.values().collect();
    ranked.sort_by(|a, b| {
        b.abundance
            .partial_cmp(&a.abundance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });

    let mut working: Vec<f64> = ranked.iter().map(|r| r.abundance).collect();

    for i in 0..ranked.len() {
        let candidate_abundance = working[i];
        if candidate_abundance <= 0.0 {
            continue;
        }
        let shed_at_one = candidate_abundance * profile.hamming_band(1).unwrap_or(0.0);
        if shed_at_one < MIN_EXPLAINED_READS {
            continue;
        }
        for j in 0..ranked.len() {
            if i == j || working[j] <= 0.0 {
                continue;
            }
            let Some(dist) = aligned_distance(&ranked[i].sequence, &ranked[j].sequence) else {
                continue;
            };
            let band = if dist.indels > 0 {
                profile.indel_band(dist.indels)
            } else {
                profile.hamming_band(dist.substitutions)
            };
            let Some(p) = band else {
                continue; // out of range, no explanatory effect
            };
            let expected = candidate_abundance * p;
            log::debug!(
                "{} explains {:.3} reads of {} (subs={}, indels={})",
                ranked[i].sequence,
                expected,
                ranked[j].sequence,
                dist.substitutions,
                dist.indels
            );
            working[j] = (working[j] - expected).max(0.0);
        }
    }

    ranked
        .iter()
        .zip(working)
        .filter(|(_, abundance)| *abundance > 0.0)
        .map(|(rec, abundance)| {
            let mut rec = (*rec).clone();
            rec.abundance = abundance;
            (rec.sequence.clone(), rec)
        })
        .collect()
}
