use cachetime_core::{
    AnalysisMap, AnalysisRow, CacheStatus, Label, Prediction, RoundSamples, SampleBundle, Verdict,
};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Decision procedure over the two timing buckets.
#[derive(Debug, Clone)]
pub struct Analyser {
    /// Multiplier applied to fixed-round samples when their mean is
    /// negative, sharpening small but consistent skews before the t-test.
    pub amplification: f64,
    /// Significance threshold for the one-sided decision.
    pub alpha: f64,
    /// Outlier cut, in standard deviations from the untrimmed mean.
    pub outlier_sigma: f64,
}

impl Default for Analyser {
    fn default() -> Self {
        Analyser {
            amplification: 5.0,
            alpha: 0.01,
            outlier_sigma: 2.0,
        }
    }
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population standard deviation (divides by n, matching the recorded
/// trimming behavior).
fn pop_std(xs: &[f64]) -> f64 {
    let m = mean(xs);
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}

/// Sample variance (divides by n − 1); what the t-test uses.
fn sample_var(xs: &[f64]) -> f64 {
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Welch's two-sample t-test (unequal variances). Returns `(t, p)` with a
/// two-sided p-value, or None when either side has fewer than two points.
pub fn welch_t_test(a: &[f64], b: &[f64]) -> Option<(f64, f64)> {
    if a.len() < 2 || b.len() < 2 {
        return None;
    }
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (va, vb) = (sample_var(a), sample_var(b));
    let se2 = va / na + vb / nb;
    if se2 == 0.0 {
        // Degenerate: both sides constant.
        let p = if mean(a) == mean(b) { 1.0 } else { 0.0 };
        return Some((0.0, p));
    }
    let t = (mean(a) - mean(b)) / se2.sqrt();
    let df = se2.powi(2)
        / ((va / na).powi(2) / (na - 1.0) + (vb / nb).powi(2) / (nb - 1.0));
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p = 2.0 * dist.cdf(-t.abs());
    Some((t, p))
}

impl Analyser {
    /// One pass: drop points farther than `outlier_sigma` standard
    /// deviations from the mean, both computed on the untrimmed data.
    pub fn remove_outliers(&self, rows: &[AnalysisRow]) -> Vec<AnalysisRow> {
        if rows.is_empty() {
            return Vec::new();
        }
        let diffs: Vec<f64> = rows.iter().map(|r| r.time_diff).collect();
        let avg = mean(&diffs);
        let std = pop_std(&diffs);
        rows.iter()
            .filter(|r| (r.time_diff - avg).abs() < self.outlier_sigma * std)
            .cloned()
            .collect()
    }

    /// Timing verdict from the two buckets. None means the data was
    /// insufficient; callers treat that as inconclusive, not as NO cache.
    pub fn predict(&self, randomized: &[AnalysisRow], fixed: &[AnalysisRow]) -> Option<Prediction> {
        let randomized = self.remove_outliers(randomized);
        let fixed = self.remove_outliers(fixed);
        if randomized.is_empty() || fixed.is_empty() {
            return None;
        }

        let fixed_diffs: Vec<f64> = fixed.iter().map(|r| r.time_diff).collect();
        let fixed_avg = mean(&fixed_diffs);
        // A cache hit on request 2 produces a negative time_diff; a positive
        // mean refutes the hypothesis outright.
        if fixed_avg > 0.0 {
            return Some(Prediction::NoCache);
        }

        let randomized_diffs: Vec<f64> = randomized.iter().map(|r| r.time_diff).collect();
        tracing::debug!(
            randomized_avg = mean(&randomized_diffs),
            randomized_std = pop_std(&randomized_diffs),
            fixed_avg,
            fixed_std = pop_std(&fixed_diffs),
            "bucket statistics"
        );

        let amplified: Vec<f64> = fixed_diffs
            .iter()
            .map(|x| if fixed_avg < 0.0 { x * self.amplification } else { *x })
            .collect();

        match welch_t_test(&randomized_diffs, &amplified) {
            Some((t, p)) => {
                tracing::debug!(t, p, "welch t-test");
                if p <= self.alpha {
                    Some(Prediction::Cache)
                } else {
                    Some(Prediction::NoCache)
                }
            }
            // Too few points for a variance estimate; same outcome as an
            // undefined p-value.
            None => Some(Prediction::NoCache),
        }
    }

    /// Header-derived corroboration, independent of the timing verdict.
    fn label(randomized: &[AnalysisRow], fixed: &[AnalysisRow]) -> Label {
        let mut label = Label::Unknown;
        let conclusive = |r: &AnalysisRow| {
            matches!(r.cache_status_1, CacheStatus::Hit | CacheStatus::Miss)
                || matches!(r.cache_status_2, CacheStatus::Hit | CacheStatus::Miss)
        };
        if randomized.iter().any(conclusive) || fixed.iter().any(conclusive) {
            label = Label::NoCache;
        }
        let hits = fixed
            .iter()
            .filter(|r| r.cache_status_2 == CacheStatus::Hit)
            .count();
        let misses = fixed
            .iter()
            .filter(|r| r.cache_status_2 == CacheStatus::Miss)
            .count();
        if hits > misses {
            label = Label::Cache;
        }
        label
    }

    /// Analyse one (url, extension, mode) cell. None when either bucket is
    /// empty or the prediction is undefined.
    pub fn analyse_rounds(&self, rounds: &RoundSamples) -> Option<Verdict> {
        let randomized: Vec<AnalysisRow> = rounds.randomized.iter().map(AnalysisRow::from).collect();
        let fixed: Vec<AnalysisRow> = rounds.fixed.iter().map(AnalysisRow::from).collect();
        if randomized.is_empty() || fixed.is_empty() {
            return None;
        }
        let statistics_prediction = self.predict(&randomized, &fixed)?;
        Some(Verdict {
            label: Self::label(&randomized, &fixed),
            statistics_prediction,
            randomized,
            fixed,
        })
    }

    /// Analyse every cell of a bundle; cells with insufficient data are
    /// omitted rather than guessed.
    pub fn analyse_bundle(&self, bundle: &SampleBundle) -> AnalysisMap {
        let mut out = AnalysisMap::new();
        for (url, extensions) in bundle {
            for (extension, modes) in extensions {
                for (mode, rounds) in modes {
                    if let Some(verdict) = self.analyse_rounds(rounds) {
                        out.entry(url.clone())
                            .or_default()
                            .entry(extension.clone())
                            .or_default()
                            .insert(mode.clone(), verdict);
                    } else {
                        tracing::info!(url, extension, mode, "insufficient data, verdict omitted");
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(time_diff: f64) -> AnalysisRow {
        AnalysisRow {
            time_diff,
            cache_status_1: CacheStatus::None,
            cache_status_2: CacheStatus::None,
        }
    }

    fn rows(xs: &[f64]) -> Vec<AnalysisRow> {
        xs.iter().copied().map(row).collect()
    }

    // Deterministic stand-ins for N(0, small) and N(-40, small).
    const JITTER: [f64; 10] = [0.4, -0.7, 1.1, -0.2, 0.9, -1.3, 0.6, 0.1, -0.5, 0.8];
    const CACHED: [f64; 10] = [-38.2, -41.5, -39.9, -40.8, -37.6, -42.1, -40.2, -39.1, -41.0, -38.8];

    #[test]
    fn clear_cache_is_detected() {
        let a = Analyser::default();
        let p = a.predict(&rows(&JITTER), &rows(&CACHED)).unwrap();
        assert_eq!(p, Prediction::Cache);
    }

    #[test]
    fn positive_fixed_mean_short_circuits() {
        let a = Analyser::default();
        let fixed = rows(&[5.0, 3.0, 8.0, 2.0, 6.0]);
        let p = a.predict(&rows(&JITTER), &fixed).unwrap();
        assert_eq!(p, Prediction::NoCache);
    }

    #[test]
    fn indistinguishable_buckets_mean_no_cache() {
        let a = Analyser::default();
        let randomized = rows(&[0.4, -0.7, 1.1, -0.2, 0.9, -1.3, 0.6, 0.1]);
        let fixed = rows(&[-0.3, 0.8, -1.0, 0.2, -0.6, 1.2, -0.1, -0.4]);
        let p = a.predict(&randomized, &fixed).unwrap();
        assert_eq!(p, Prediction::NoCache);
    }

    #[test]
    fn empty_bucket_after_trim_is_undefined() {
        let a = Analyser::default();
        assert!(a.predict(&rows(&JITTER), &[]).is_none());
        assert!(a.predict(&[], &rows(&CACHED)).is_none());
    }

    #[test]
    fn outlier_trim_is_one_pass_on_untrimmed_stats() {
        let a = Analyser::default();
        let data = rows(&[1.0, 2.0, 1.5, 1.2, 0.8, 1.1, 1.9, 1.4, 0.9, 1000.0]);
        let trimmed = a.remove_outliers(&data);
        // The extreme point inflates the untrimmed σ enough that only it
        // falls outside 2σ.
        assert_eq!(trimmed.len(), 9);
        assert!(trimmed.iter().all(|r| r.time_diff < 10.0));
    }

    #[test]
    fn predict_is_idempotent() {
        let a = Analyser::default();
        let r = rows(&JITTER);
        let f = rows(&CACHED);
        assert_eq!(a.predict(&r, &f), a.predict(&r, &f));
    }

    #[test]
    fn amplification_is_inert_for_nonnegative_fixed_mean() {
        // mean(fixed) > 0 short-circuits before amplification; mean == 0
        // falls through without the multiplier. Either way the factor
        // cannot flip NO cache into CACHE.
        let randomized = rows(&JITTER);
        let zero_mean = rows(&[-1.0, 1.0, -2.0, 2.0, -0.5, 0.5]);
        let small = Analyser { amplification: 5.0, ..Default::default() };
        let large = Analyser { amplification: 50.0, ..Default::default() };
        assert_eq!(
            small.predict(&randomized, &zero_mean),
            large.predict(&randomized, &zero_mean)
        );

        let positive = rows(&[3.0, 4.0, 2.0, 5.0, 3.5]);
        assert_eq!(
            large.predict(&randomized, &positive),
            Some(Prediction::NoCache)
        );
    }

    #[test]
    fn p_equal_to_alpha_is_cache() {
        let randomized = rows(&JITTER);
        let fixed = rows(&[-2.0, -3.1, -2.6, -1.9, -2.8, -3.4, -2.2, -2.9]);
        // Amplified exactly as predict() would.
        let amplified: Vec<f64> = fixed.iter().map(|r| r.time_diff * 5.0).collect();
        let r_diffs: Vec<f64> = randomized.iter().map(|r| r.time_diff).collect();
        let (_, p) = welch_t_test(&r_diffs, &amplified).unwrap();
        let at_threshold = Analyser { alpha: p, ..Default::default() };
        assert_eq!(
            at_threshold.predict(&randomized, &fixed),
            Some(Prediction::Cache)
        );
    }

    #[test]
    fn welch_handles_degenerate_input() {
        assert!(welch_t_test(&[1.0], &[2.0, 3.0]).is_none());
        let (t, p) = welch_t_test(&[1.0, 1.0], &[1.0, 1.0]).unwrap();
        assert_eq!(t, 0.0);
        assert_eq!(p, 1.0);
        let (_, p) = welch_t_test(&[1.0, 1.0], &[2.0, 2.0]).unwrap();
        assert_eq!(p, 0.0);
    }

    #[test]
    fn welch_matches_reference_values() {
        // Symmetric inputs with closed-form statistics: t = −√1.5 on 6
        // degrees of freedom, two-sided p = I_{0.8}(3, ½) ≈ 0.26657.
        let a = [0.0, 0.0, 2.0, 2.0];
        let b = [1.0, 1.0, 3.0, 3.0];
        let (t, p) = welch_t_test(&a, &b).unwrap();
        assert!((t + 1.5f64.sqrt()).abs() < 1e-9, "t={t}");
        assert!((p - 0.26657).abs() < 2e-3, "p={p}");
    }

    #[test]
    fn label_prefers_fixed_round_hits() {
        let hit = AnalysisRow {
            time_diff: -10.0,
            cache_status_1: CacheStatus::Miss,
            cache_status_2: CacheStatus::Hit,
        };
        let verdict_rows = vec![hit.clone(), hit.clone(), hit];
        assert_eq!(Analyser::label(&[], &verdict_rows), Label::Cache);

        let miss_only = AnalysisRow {
            time_diff: 1.0,
            cache_status_1: CacheStatus::Miss,
            cache_status_2: CacheStatus::Miss,
        };
        assert_eq!(Analyser::label(&[miss_only.clone()], &[miss_only]), Label::NoCache);

        assert_eq!(Analyser::label(&[row(0.1)], &[row(-0.2)]), Label::Unknown);
    }

    #[test]
    fn analyse_rounds_builds_rounded_rows() {
        use cachetime_core::{Sample, SampleSide};
        use std::collections::BTreeMap;

        let side = |status: CacheStatus| SampleSide {
            status: 200,
            headers: BTreeMap::new(),
            body: String::new(),
            cache_status: status,
        };
        let sample = |d: f64, s2: CacheStatus| Sample {
            time_diff: d,
            first: side(CacheStatus::Miss),
            second: side(s2),
        };

        let rounds = RoundSamples {
            randomized: JITTER.iter().map(|d| sample(*d, CacheStatus::Miss)).collect(),
            fixed: CACHED.iter().map(|d| sample(*d, CacheStatus::Hit)).collect(),
        };
        let verdict = Analyser::default().analyse_rounds(&rounds).unwrap();
        assert_eq!(verdict.statistics_prediction, Prediction::Cache);
        assert_eq!(verdict.label, Label::Cache);
        assert_eq!(verdict.randomized.len(), JITTER.len());
        // time_diff persisted to two decimal places.
        assert_eq!(verdict.fixed[0].time_diff, -38.2);
    }
}
