// src/error_model.rs

use crate::errors::{DeblurError, Result};

/// Number of Hamming-distance bands when the profile is derived from a
/// flat read-error rate instead of being given explicitly.
pub const DERIVED_PROFILE_LEN: usize = 12;

/// Per-run error model: expected fraction of a true sequence's reads
/// that are misread into a variant at a given Hamming distance, plus a
/// single coarse band for indel variants.
///
/// Immutable once built. Distances past the end of `error_dist` have no
/// explanatory effect.
#[derive(Debug, Clone)]
pub struct ErrorProfile {
    error_dist: Vec<f64>,
    indel_prob: f64,
    indel_max: usize,
}

impl ErrorProfile {
    /// Builds a profile for one run.
    ///
    /// When `error_dist` is given it is used directly and its length
    /// defines the maximum Hamming distance considered. Otherwise the
    /// table is derived from the flat per-base rate `read_error` over
    /// reads of `trim_length` bases: band `d` is the binomial
    /// probability of exactly `d` miscalled bases, scaled by
    /// `(1 - mean_error)^-trim_length` to account for the expected loss
    /// of error-free reads from the true sequence. `mean_error`
    /// defaults to `read_error`.
    pub fn build(
        read_error: f64,
        mean_error: Option<f64>,
        error_dist: Option<Vec<f64>>,
        indel_prob: f64,
        indel_max: usize,
        trim_length: Option<usize>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&indel_prob) {
            return Err(DeblurError::config(
                "indel-prob",
                format!("probability {indel_prob} outside [0, 1]"),
            ));
        }

        let error_dist = match error_dist {
            Some(dist) => {
                if dist.is_empty() {
                    return Err(DeblurError::config("error-dist", "list is empty"));
                }
                for &p in &dist {
                    if !(0.0..=1.0).contains(&p) {
                        return Err(DeblurError::config(
                            "error-dist",
                            format!("probability {p} outside [0, 1]"),
                        ));
                    }
                }
                dist
            }
            None => {
                if !(0.0..=1.0).contains(&read_error) {
                    return Err(DeblurError::config(
                        "read-error",
                        format!("probability {read_error} outside [0, 1]"),
                    ));
                }
                let mean_error = mean_error.unwrap_or(read_error);
                if !(0.0..=1.0).contains(&mean_error) {
                    return Err(DeblurError::config(
                        "mean-error",
                        format!("probability {mean_error} outside [0, 1]"),
                    ));
                }
                let trim_length = trim_length.filter(|&l| l > 0).ok_or_else(|| {
                    DeblurError::config(
                        "trim-length",
                        "a positive trim length is required to derive the error profile",
                    )
                })?;
                derive_error_dist(read_error, mean_error, trim_length)
            }
        };

        Ok(Self { error_dist, indel_prob, indel_max })
    }

    /// Expected fraction misread at Hamming distance `d`, or `None`
    /// past the configured maximum distance.
    pub fn hamming_band(&self, d: usize) -> Option<f64> {
        self.error_dist.get(d).copied()
    }

    /// Expected fraction misread into a variant with `k` indels, or
    /// `None` past `indel_max`. A single coarse band, independent of
    /// the Hamming table.
    pub fn indel_band(&self, k: usize) -> Option<f64> {
        (k >= 1 && k <= self.indel_max).then_some(self.indel_prob)
    }

    /// One past the largest Hamming distance with explanatory effect.
    pub fn max_hamming_dist(&self) -> usize {
        self.error_dist.len()
    }

    pub fn indel_max(&self) -> usize {
        self.indel_max
    }
}

/// Binomial pmf over `trim_length` trials at rate `read_error`, scaled
/// by the inverse survival probability of an error-free read. Band 0 is
/// pinned at 1.0 and every band is clamped to [0, 1].
fn derive_error_dist(read_error: f64, mean_error: f64, trim_length: usize) -> Vec<f64> {
    let l = trim_length as f64;
    let mod_factor = (1.0 - mean_error).powf(l);
    let mut dist = Vec::with_capacity(DERIVED_PROFILE_LEN);
    dist.push(1.0);

    // pmf(d) = pmf(d-1) * (L - d + 1) / d * p / (1 - p)
    let mut pmf = (1.0 - read_error).powf(l);
    for d in 1..DERIVED_PROFILE_LEN {
        if read_error >= 1.0 {
            dist.push(1.0);
            continue;
        }
        pmf *= (l - d as f64 + 1.0).max(0.0) / d as f64 * read_error / (1.0 - read_error);
        let scaled = if mod_factor > 0.0 { pmf / mod_factor } else { 1.0 };
        dist.push(scaled.clamp(0.0, 1.0));
    }
    dist
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_dist_used_verbatim() {
        let profile =
            ErrorProfile::build(0.05, None, Some(vec![1.0, 0.06, 0.02]), 0.01, 3, None).unwrap();
        assert_eq!(profile.max_hamming_dist(), 3);
        assert_eq!(profile.hamming_band(0), Some(1.0));
        assert_eq!(profile.hamming_band(1), Some(0.06));
        assert_eq!(profile.hamming_band(2), Some(0.02));
        assert_eq!(profile.hamming_band(3), None);
    }

    #[test]
    fn test_empty_explicit_dist_rejected() {
        let err = ErrorProfile::build(0.05, None, Some(vec![]), 0.01, 3, None).unwrap_err();
        assert!(matches!(err, DeblurError::Config { .. }));
    }

    #[test]
    fn test_out_of_range_probability_rejected() {
        let err =
            ErrorProfile::build(0.05, None, Some(vec![1.0, 1.5]), 0.01, 3, None).unwrap_err();
        assert!(matches!(err, DeblurError::Config { .. }));

        let err = ErrorProfile::build(0.05, None, None, -0.1, 3, Some(100)).unwrap_err();
        assert!(matches!(err, DeblurError::Config { .. }));

        let err = ErrorProfile::build(2.0, None, None, 0.01, 3, Some(100)).unwrap_err();
        assert!(matches!(err, DeblurError::Config { .. }));
    }

    #[test]
    fn test_derived_needs_trim_length() {
        let err = ErrorProfile::build(0.05, None, None, 0.01, 3, None).unwrap_err();
        assert!(matches!(err, DeblurError::Config { .. }));
    }

    #[test]
    fn test_derived_profile_shape() {
        let profile = ErrorProfile::build(0.005, None, None, 0.01, 3, Some(100)).unwrap();
        assert_eq!(profile.max_hamming_dist(), DERIVED_PROFILE_LEN);
        assert_eq!(profile.hamming_band(0), Some(1.0));
        // Bands decay once d passes the expected error count (~0.5 here)
        let b1 = profile.hamming_band(1).unwrap();
        let b2 = profile.hamming_band(2).unwrap();
        let b3 = profile.hamming_band(3).unwrap();
        assert!(b1 > b2 && b2 > b3);
        for d in 0..DERIVED_PROFILE_LEN {
            let p = profile.hamming_band(d).unwrap();
            assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn test_derived_mean_error_scaling() {
        // A larger mean error shrinks the pool of error-free reads, so
        // each band explains a larger fraction of the true abundance.
        let base = ErrorProfile::build(0.005, Some(0.005), None, 0.01, 3, Some(100)).unwrap();
        let scaled = ErrorProfile::build(0.005, Some(0.05), None, 0.01, 3, Some(100)).unwrap();
        assert!(scaled.hamming_band(1).unwrap() > base.hamming_band(1).unwrap());
    }

    #[test]
    fn test_indel_band_bounds() {
        let profile =
            ErrorProfile::build(0.05, None, Some(vec![1.0, 0.06]), 0.01, 3, None).unwrap();
        assert_eq!(profile.indel_band(0), None);
        assert_eq!(profile.indel_band(1), Some(0.01));
        assert_eq!(profile.indel_band(3), Some(0.01));
        assert_eq!(profile.indel_band(4), None);
    }
}
