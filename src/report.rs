use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::batch::TrackRecord;
use crate::evaluator::{earliest_perfect_distance, ResultTable};

/// Horizon offsets (future steps) scored by default.
pub const DEFAULT_HORIZONS: [usize; 3] = [5, 10, 13];

/// Thresholds closer than this are the same bucket.
const DISTANCE_EPS: f32 = 1e-4;

// ---------------------------------------------------------------------------
// Classification F1 per distance and class
// ---------------------------------------------------------------------------

/// Rates are fractions of `n_tracks`; `f1` is computed on the raw counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct F1Row {
    pub distance: f32,
    pub class_name: String,
    pub n_tracks: usize,
    pub true_positive: f64,
    pub false_positive: f64,
    pub false_negative: f64,
    pub f1: f64,
}

/// Classes whose share of the sample population exceeds `class_threshold`.
/// Abstaining samples count toward the population but vote for nothing.
fn chosen_classes(votes: &[u32], population: usize, class_threshold: f64) -> Vec<bool> {
    let total = population.max(votes.iter().sum::<u32>() as usize);
    votes
        .iter()
        .map(|&v| total > 0 && v as f64 / total as f64 > class_threshold)
        .collect()
}

/// Per (distance, class): TP rows are classified exactly as their one-hot,
/// FN rows have no class above threshold, FP is everything else of that class.
pub fn distance_f1_report(table: &ResultTable, class_threshold: f64) -> Vec<F1Row> {
    let mut out = Vec::new();
    for d in table.thresholds() {
        for (class, name) in table.class_names.iter().enumerate() {
            let rows: Vec<_> = table
                .rows
                .iter()
                .filter(|r| r.true_class == class && (r.d_thresh - d).abs() < DISTANCE_EPS)
                .collect();
            let n = rows.len();
            let (mut tp, mut fn_) = (0usize, 0usize);
            for r in &rows {
                let chosen = chosen_classes(&r.votes, table.num_samples, class_threshold);
                let truth = (0..chosen.len()).map(|k| r.ground_truth.get(k).copied().unwrap_or(0.0) > 0.5);
                if chosen.iter().copied().eq(truth) {
                    tp += 1;
                } else if !chosen.iter().any(|&c| c) {
                    fn_ += 1;
                }
            }
            let fp = n - tp - fn_;
            let denom = 2 * tp + fp + fn_;
            let f1 = if denom == 0 { 0.0 } else { 2.0 * tp as f64 / denom as f64 };
            let n_tracks = n.max(1);
            out.push(F1Row {
                distance: d,
                class_name: name.clone(),
                n_tracks,
                true_positive: tp as f64 / n_tracks as f64,
                false_positive: fp as f64 / n_tracks as f64,
                false_negative: fn_ as f64 / n_tracks as f64,
                f1,
            });
        }
    }
    out
}

/// F1 values keyed `f1_<class>`, one per distance, for summarising.
pub fn f1_by_class(rows: &[F1Row]) -> BTreeMap<String, Vec<f64>> {
    let mut out: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for r in rows {
        out.entry(format!("f1_{}", r.class_name)).or_default().push(r.f1);
    }
    out
}

// ---------------------------------------------------------------------------
// Trajectory metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPrediction {
    pub track_idx: usize,
    pub class_name: String,
    pub predicted: Vec<[f32; 2]>,
    pub ground_truth: Vec<[f32; 2]>,
    pub padding: Vec<bool>,
}

impl TrackPrediction {
    /// From per-step model output rows whose first two columns are the position.
    pub fn from_sampled(record: &TrackRecord, steps: &[Vec<f32>]) -> Self {
        Self {
            track_idx: record.track_idx,
            class_name: record.class_name.clone(),
            predicted: steps.iter().map(|s| [s[0], s[1]]).collect(),
            ground_truth: record.future.iter().map(|s| [s[0], s[1]]).collect(),
            padding: record.future_padding.clone(),
        }
    }

    /// (prediction, truth) pairs over the real steps.
    fn real_pairs(&self) -> Vec<([f32; 2], [f32; 2])> {
        self.predicted
            .iter()
            .zip(&self.ground_truth)
            .zip(&self.padding)
            .filter(|&(_, &pad)| !pad)
            .map(|((&p, &g), _)| (p, g))
            .collect()
    }
}

fn euclidean(a: [f32; 2], b: [f32; 2]) -> f64 {
    ((a[0] - b[0]) as f64).hypot((a[1] - b[1]) as f64)
}

/// max(mean nearest distance A->B, mean nearest distance B->A). Squared
/// distances are clamped at zero before the square root.
pub fn modified_hausdorff(a: &[[f32; 2]], b: &[[f32; 2]]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let sq = |p: [f32; 2]| (p[0] as f64).powi(2) + (p[1] as f64).powi(2);
    let dist: Vec<Vec<f64>> = a
        .iter()
        .map(|&p| {
            b.iter()
                .map(|&q| {
                    let dot = p[0] as f64 * q[0] as f64 + p[1] as f64 * q[1] as f64;
                    (sq(p) + sq(q) - 2.0 * dot).max(0.0).sqrt()
                })
                .collect()
        })
        .collect();
    let forward = dist
        .iter()
        .map(|row| row.iter().copied().fold(f64::INFINITY, f64::min))
        .sum::<f64>()
        / a.len() as f64;
    let reverse = (0..b.len())
        .map(|j| dist.iter().map(|row| row[j]).fold(f64::INFINITY, f64::min))
        .sum::<f64>()
        / b.len() as f64;
    forward.max(reverse)
}

/// `euclidean` (mean over real steps), `horizon_steps_<d>` for each horizon
/// inside the track, and `MHD`. Empty for a track with no real steps.
pub fn track_metrics(pred: &TrackPrediction, horizons: &[usize]) -> BTreeMap<String, f64> {
    let pairs = pred.real_pairs();
    let mut out = BTreeMap::new();
    if pairs.is_empty() {
        return out;
    }
    let errors: Vec<f64> = pairs.iter().map(|&(p, g)| euclidean(p, g)).collect();
    out.insert("euclidean".to_string(), errors.iter().sum::<f64>() / errors.len() as f64);
    for &d in horizons {
        if let Some(&e) = errors.get(d) {
            out.insert(format!("horizon_steps_{d}"), e);
        }
    }
    let (p, g): (Vec<[f32; 2]>, Vec<[f32; 2]>) = pairs.into_iter().unzip();
    out.insert("MHD".to_string(), modified_hausdorff(&p, &g));
    out
}

/// Every track's metric values grouped by metric name.
pub fn score_tracks(preds: &[TrackPrediction], horizons: &[usize]) -> BTreeMap<String, Vec<f64>> {
    let mut out: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for p in preds {
        for (name, v) in track_metrics(p, horizons) {
            out.entry(name).or_default().push(v);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub median: f64,
    pub mean: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Linear interpolation between closest ranks; `sorted` must be ascending.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

pub fn summarize(values: &[f64]) -> Option<Summary> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    Some(Summary {
        count: sorted.len(),
        median: percentile(&sorted, 50.0),
        mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
    })
}

pub fn summarize_all(metrics: &BTreeMap<String, Vec<f64>>) -> BTreeMap<String, Summary> {
    metrics
        .iter()
        .filter_map(|(k, v)| summarize(v).map(|s| (k.clone(), s)))
        .collect()
}

// ---------------------------------------------------------------------------
// Constant-velocity baseline
// ---------------------------------------------------------------------------

/// Extrapolates the last observed displacement for `steps` steps.
pub fn constant_velocity_baseline(record: &TrackRecord, steps: usize) -> Vec<[f32; 2]> {
    let n = record.observations.len();
    let Some(last) = record.last_observed_position() else {
        return vec![[0.0, 0.0]; steps];
    };
    let v = if n >= 2 {
        let prev = &record.observations[n - 2];
        [last[0] - prev[0], last[1] - prev[1]]
    } else {
        [0.0, 0.0]
    };
    (1..=steps)
        .map(|t| [last[0] + v[0] * t as f32, last[1] + v[1] * t as f32])
        .collect()
}

/// Baseline predictions for the same records the model was scored on.
pub fn baseline_predictions<'a>(records: impl IntoIterator<Item = &'a Arc<TrackRecord>>) -> Vec<TrackPrediction> {
    records
        .into_iter()
        .map(|r| TrackPrediction {
            track_idx: r.track_idx,
            class_name: r.class_name.clone(),
            predicted: constant_velocity_baseline(r, r.future.len()),
            ground_truth: r.future.iter().map(|s| [s[0], s[1]]).collect(),
            padding: r.future_padding.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Plot
// ---------------------------------------------------------------------------

/// Predicted (red) against ground truth (green) as a standalone SVG.
pub fn trajectory_svg(pred: &TrackPrediction) -> String {
    const SIZE: f32 = 256.0;
    const MARGIN: f32 = 8.0;
    let all: Vec<[f32; 2]> = pred
        .predicted
        .iter()
        .chain(&pred.ground_truth)
        .copied()
        .filter(|p| p[0].is_finite() && p[1].is_finite())
        .collect();
    let (mut x0, mut y0, mut x1, mut y1) = (f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY);
    for p in &all {
        x0 = x0.min(p[0]);
        y0 = y0.min(p[1]);
        x1 = x1.max(p[0]);
        y1 = y1.max(p[1]);
    }
    let span = (x1 - x0).max(y1 - y0).max(1e-3);
    let project = |p: &[f32; 2]| {
        let x = MARGIN + (p[0] - x0) / span * (SIZE - 2.0 * MARGIN);
        let y = SIZE - MARGIN - (p[1] - y0) / span * (SIZE - 2.0 * MARGIN);
        format!("{x:.1},{y:.1}")
    };
    let polyline = |points: &[[f32; 2]], colour: &str| {
        let pts: Vec<String> = points
            .iter()
            .filter(|p| p[0].is_finite() && p[1].is_finite())
            .map(project)
            .collect();
        format!(
            "<polyline fill=\"none\" stroke=\"{colour}\" stroke-width=\"2\" points=\"{}\"/>",
            pts.join(" ")
        )
    };
    let truth: Vec<[f32; 2]> = pred
        .ground_truth
        .iter()
        .zip(&pred.padding)
        .filter(|&(_, &pad)| !pad)
        .map(|(&p, _)| p)
        .collect();
    format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{SIZE}\" height=\"{SIZE}\">{}{}</svg>",
        polyline(&truth, "green"),
        polyline(&pred.predicted, "red")
    )
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub f1: Vec<F1Row>,
    pub f1_summary: BTreeMap<String, Summary>,
    pub earliest_perfect_distance: BTreeMap<String, f32>,
    /// model name -> metric name -> summary
    pub trajectory: BTreeMap<String, BTreeMap<String, Summary>>,
}

impl Report {
    pub fn build(
        table: &ResultTable,
        class_threshold: f64,
        models: &[(&str, &[TrackPrediction])],
        horizons: &[usize],
    ) -> Self {
        let f1 = distance_f1_report(table, class_threshold);
        let f1_summary = summarize_all(&f1_by_class(&f1));
        let trajectory = models
            .iter()
            .map(|(name, preds)| (name.to_string(), summarize_all(&score_tracks(preds, horizons))))
            .collect();
        Self {
            f1,
            f1_summary,
            earliest_perfect_distance: earliest_perfect_distance(table),
            trajectory,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::ResultRow;

    fn result_row(track: usize, class: usize, votes: Vec<u32>, d: f32) -> ResultRow {
        let mut ground_truth = vec![0.0; 2];
        ground_truth[class] = 1.0;
        let predicted_class = votes
            .iter()
            .enumerate()
            .max_by_key(|&(_, &v)| v)
            .filter(|&(_, &v)| v > 0)
            .map(|(k, _)| k);
        ResultRow {
            record_id: 0,
            track_idx: track,
            class_name: format!("class_{class}"),
            true_class: class,
            ground_truth,
            votes,
            predicted_class,
            d_thresh: d,
            distance: d,
        }
    }

    fn prediction(predicted: Vec<[f32; 2]>, ground_truth: Vec<[f32; 2]>) -> TrackPrediction {
        let padding = vec![false; ground_truth.len()];
        TrackPrediction {
            track_idx: 0,
            class_name: "c".into(),
            predicted,
            ground_truth,
            padding,
        }
    }

    #[test]
    fn test_f1_scenario_three_tracks() {
        // A: class 0, always right. B: class 1 track voting class 0.
        // C: class 0, votes split so nothing clears 0.95.
        let mut rows = Vec::new();
        for d in [0.0f32, 1.0, 2.0] {
            rows.push(result_row(0, 0, vec![20, 0], d));
            rows.push(result_row(1, 1, vec![20, 0], d));
            rows.push(result_row(2, 0, vec![10, 10], d));
        }
        let table = ResultTable {
            class_names: vec!["class_0".into(), "class_1".into()],
            num_samples: 20,
            rows,
        };
        let f1 = distance_f1_report(&table, 0.95);
        assert_eq!(f1.len(), 6);
        for r in f1.iter().filter(|r| r.class_name == "class_0") {
            assert_eq!(r.n_tracks, 2);
            assert!((r.f1 - 2.0 / 3.0).abs() < 1e-12, "f1={}", r.f1);
            assert!((r.true_positive - 0.5).abs() < 1e-12);
            assert_eq!(r.false_positive, 0.0);
            assert!((r.false_negative - 0.5).abs() < 1e-12);
        }
        for r in f1.iter().filter(|r| r.class_name == "class_1") {
            assert_eq!(r.f1, 0.0);
            assert_eq!(r.false_positive, 1.0);
        }
        let summary = summarize_all(&f1_by_class(&f1));
        assert!((summary["f1_class_0"].median - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_abstaining_samples_dilute_votes() {
        // 20 samples, most of which produced no class
        let table = ResultTable {
            class_names: vec!["class_0".into(), "class_1".into()],
            num_samples: 20,
            rows: vec![result_row(0, 0, vec![1, 0], 0.0), result_row(1, 0, vec![20, 0], 0.0)],
        };
        let f1 = distance_f1_report(&table, 0.95);
        let class_0 = &f1[0];
        assert_eq!(class_0.n_tracks, 2);
        assert!((class_0.true_positive - 0.5).abs() < 1e-12);
        assert!((class_0.false_negative - 0.5).abs() < 1e-12);
        assert!((class_0.f1 - 2.0 / 3.0).abs() < 1e-12);

        // 19 of 20 sits exactly on the threshold, which is not above it
        let borderline = ResultTable {
            rows: vec![result_row(0, 0, vec![19, 0], 0.0)],
            ..table
        };
        assert_eq!(distance_f1_report(&borderline, 0.95)[0].false_negative, 1.0);
    }

    #[test]
    fn test_f1_perfect_and_empty() {
        let table = ResultTable {
            class_names: vec!["class_0".into(), "class_1".into()],
            num_samples: 5,
            rows: vec![result_row(0, 0, vec![5, 0], 0.0), result_row(1, 0, vec![5, 0], 0.0)],
        };
        let f1 = distance_f1_report(&table, 0.95);
        assert_eq!(f1[0].f1, 1.0);
        // no class_1 rows: zero counts, synthetic single-track denominator
        assert_eq!(f1[1].f1, 0.0);
        assert_eq!(f1[1].n_tracks, 1);
        assert_eq!(f1[1].true_positive, 0.0);
    }

    #[test]
    fn test_horizon_matches_direct_distance() {
        let gt: Vec<[f32; 2]> = (0..15).map(|t| [t as f32, 0.0]).collect();
        let pred: Vec<[f32; 2]> = (0..15).map(|t| [t as f32, t as f32 * 0.5]).collect();
        let m = track_metrics(&prediction(pred, gt), &DEFAULT_HORIZONS);
        assert!((m["horizon_steps_5"] - 2.5).abs() < 1e-9);
        assert!((m["horizon_steps_10"] - 5.0).abs() < 1e-9);
        assert!((m["horizon_steps_13"] - 6.5).abs() < 1e-9);
    }

    #[test]
    fn test_short_track_skips_horizon() {
        let gt: Vec<[f32; 2]> = (0..8).map(|t| [t as f32, 0.0]).collect();
        let pred = gt.clone();
        let mut p = prediction(pred, gt);
        // padding shortens the real track to 6 steps
        p.padding[6] = true;
        p.padding[7] = true;
        let m = track_metrics(&p, &DEFAULT_HORIZONS);
        assert_eq!(m["horizon_steps_5"], 0.0);
        assert!(!m.contains_key("horizon_steps_10"));
        assert!(!m.contains_key("horizon_steps_13"));

        let scores = score_tracks(&[p], &DEFAULT_HORIZONS);
        assert!(!scores.contains_key("horizon_steps_10"));
    }

    #[test]
    fn test_modified_hausdorff() {
        let a = [[0.0f32, 0.0], [1.0, 0.0]];
        assert_eq!(modified_hausdorff(&a, &a), 0.0);
        let b = [[0.0f32, 1.0], [1.0, 1.0], [5.0, 1.0]];
        // a->b: 1, 1 -> 1; b->a: 1, 1, sqrt(17) -> (2 + 17^0.5) / 3
        let expected = (2.0 + 17f64.sqrt()) / 3.0;
        assert!((modified_hausdorff(&a, &b) - expected).abs() < 1e-6);
        // large coordinates cancel to tiny negatives without the clamp
        let big = [[1e4f32, 1e4]];
        assert!(modified_hausdorff(&big, &big).is_finite());
    }

    #[test]
    fn test_percentiles_interpolate() -> Result<()> {
        let s = summarize(&[4.0, 1.0, 3.0, 2.0]).ok_or_else(|| anyhow::anyhow!("empty"))?;
        assert_eq!(s.count, 4);
        assert!((s.median - 2.5).abs() < 1e-12);
        assert!((s.mean - 2.5).abs() < 1e-12);
        assert!((s.p95 - 3.85).abs() < 1e-12);
        assert!((s.p99 - 3.97).abs() < 1e-12);
        assert!(summarize(&[]).is_none());
        Ok(())
    }

    #[test]
    fn test_constant_velocity_baseline() {
        let record = TrackRecord {
            track_idx: 0,
            class_idx: 0,
            class_name: "c".into(),
            distance: 0.0,
            observations: vec![vec![0.0, 0.0], vec![1.0, 2.0]],
            future: vec![vec![2.0, 4.0], vec![3.0, 6.0]],
            future_padding: vec![false, false],
        };
        assert_eq!(constant_velocity_baseline(&record, 2), vec![[2.0, 4.0], [3.0, 6.0]]);
        let preds = baseline_predictions([&Arc::new(record)]);
        let m = track_metrics(&preds[0], &[1]);
        assert_eq!(m["euclidean"], 0.0);
        assert_eq!(m["horizon_steps_1"], 0.0);
    }

    #[test]
    fn test_svg_has_both_paths() {
        let p = prediction(vec![[0.0, 0.0], [1.0, 1.0]], vec![[0.0, 0.0], [1.0, 0.0]]);
        let svg = trajectory_svg(&p);
        assert!(svg.starts_with("<svg"));
        assert_eq!(svg.matches("<polyline").count(), 2);
    }
}
