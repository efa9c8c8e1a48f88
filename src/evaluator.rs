// Distance-binned evaluation.
//
// One combined pass over every requested distance threshold: the source tags
// each record with its bucket, the driver samples each batch `num_samples`
// times, and every sample votes for the class its trajectory resembles.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};

use crate::batch::{BatchRow, BatchSource, ClassPrototypes, TrackRecord};
use crate::error::EvalError;
use crate::report::TrackPrediction;
use crate::step::StepDriver;

/// Distance thresholds closer than this are the same bucket.
const DISTANCE_EPS: f32 = 1e-4;

// ---------------------------------------------------------------------------
// Scoped filter
// ---------------------------------------------------------------------------

/// Exclusive use of a batch source. Clears both distance filters and rewinds
/// the cursor when dropped, on success and on early return alike.
pub struct FilterGuard<'a, S: BatchSource + ?Sized> {
    source: &'a mut S,
}

impl<'a, S: BatchSource + ?Sized> FilterGuard<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        source.reset_cursor();
        Self { source }
    }
}

impl<S: BatchSource + ?Sized> Deref for FilterGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.source
    }
}

impl<S: BatchSource + ?Sized> DerefMut for FilterGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.source
    }
}

impl<S: BatchSource + ?Sized> Drop for FilterGuard<'_, S> {
    fn drop(&mut self) {
        self.source.set_distance_threshold(None);
        self.source.set_distance_threshold_ranges(None);
        self.source.reset_cursor();
    }
}

// ---------------------------------------------------------------------------
// Result table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// 0-based, stable within one evaluation pass only.
    pub record_id: usize,
    pub track_idx: usize,
    pub class_name: String,
    pub true_class: usize,
    pub ground_truth: Vec<f32>,
    /// Per-class vote counts over all samples.
    pub votes: Vec<u32>,
    /// Arg-max of `votes`; `None` when no sample produced a vote.
    pub predicted_class: Option<usize>,
    pub d_thresh: f32,
    pub distance: f32,
}

impl ResultRow {
    pub fn is_correct(&self) -> bool {
        self.predicted_class == Some(self.true_class)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub class_names: Vec<String>,
    /// Inference samples drawn per row; the vote population, abstentions included.
    #[serde(default)]
    pub num_samples: usize,
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    /// Sorted unique thresholds present in the table.
    pub fn thresholds(&self) -> Vec<f32> {
        let mut ts: Vec<f32> = self.rows.iter().map(|r| r.d_thresh).collect();
        ts.sort_by(f32::total_cmp);
        ts.dedup_by(|a, b| (*a - *b).abs() < DISTANCE_EPS);
        ts
    }
}

fn argmax_votes(votes: &[u32]) -> Option<usize> {
    let (k, &best) = votes
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))?;
    (best > 0).then_some(k)
}

/// Time index whose prediction stands for the whole trajectory: the last real step.
fn endpoint_index(record: &TrackRecord) -> usize {
    record
        .future_padding
        .iter()
        .rposition(|&pad| !pad)
        .unwrap_or_else(|| record.future_padding.len().saturating_sub(1))
}

/// Votes from one inference sample, one entry per batch row.
fn sample_votes(
    rows: &[BatchRow],
    sampled: &[Vec<Vec<f32>>],
    prototypes: &ClassPrototypes,
) -> Vec<Option<usize>> {
    rows.iter()
        .zip(sampled)
        .map(|(row, traj)| {
            let step = traj.get(endpoint_index(&row.record))?;
            prototypes.classify(&row.record, [step[0], step[1]])
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Long-form vote table over every (track, threshold) the source can supply.
///
/// Fails with [`EvalError::EmptyResult`] when no record matched any threshold.
pub fn evaluate<S: BatchSource + ?Sized>(
    driver: &mut StepDriver,
    source: &mut S,
    thresholds: &[f32],
    prototypes: &ClassPrototypes,
) -> Result<ResultTable> {
    let num_classes = prototypes.num_classes();
    let num_samples = driver.model().config.num_samples.max(1);
    let device = driver.device().clone();

    let mut guard = FilterGuard::new(source);
    guard.set_distance_threshold(None);
    guard.set_distance_threshold_ranges(Some(thresholds.to_vec()));

    let mut rows = Vec::new();
    loop {
        let (minibatch, is_final) = guard.get_sequential_minibatch()?;
        let Some(minibatch) = minibatch else {
            break;
        };
        let batch = guard.format_minibatch_data(&minibatch, &device)?;
        let mut votes = vec![vec![0u32; num_classes]; minibatch.len()];
        for _ in 0..num_samples {
            let out = driver.step(&batch, false, None)?;
            let sampled = out
                .sampled
                .ok_or_else(|| anyhow!("inference step returned no samples"))?
                .to_vec3::<f32>()?;
            for (row_votes, vote) in votes.iter_mut().zip(sample_votes(&minibatch.rows, &sampled, prototypes)) {
                if let Some(k) = vote {
                    row_votes[k] += 1;
                }
            }
        }
        for (row, votes) in minibatch.rows.iter().zip(votes) {
            if row.is_filler {
                continue;
            }
            let r = &row.record;
            rows.push(ResultRow {
                record_id: rows.len(),
                track_idx: r.track_idx,
                class_name: r.class_name.clone(),
                true_class: r.class_idx,
                ground_truth: r.one_hot(num_classes),
                predicted_class: argmax_votes(&votes),
                votes,
                d_thresh: row.d_thresh.unwrap_or(r.distance),
                distance: r.distance,
            });
        }
        if is_final {
            break;
        }
    }

    if rows.is_empty() {
        return Err(EvalError::EmptyResult {
            thresholds: thresholds.to_vec(),
        }
        .into());
    }
    tracing::info!(rows = rows.len(), thresholds = thresholds.len(), num_samples, "evaluated");
    Ok(ResultTable {
        class_names: prototypes.names.clone(),
        num_samples,
        rows,
    })
}

// ---------------------------------------------------------------------------
// Validation pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ValidationSummary {
    /// Mean step loss over the batches seen.
    pub loss: f32,
    /// Fraction of real records whose sampled trajectory lands in their own class.
    pub class_accuracy: f64,
    pub records: usize,
    /// First real record of the pass, for plotting.
    pub example: Option<TrackPrediction>,
}

/// Inference over the whole source, or one random batch when `quick`.
/// Leaves any distance filter in place.
pub fn run_validation<S: BatchSource + ?Sized>(
    driver: &mut StepDriver,
    source: &mut S,
    prototypes: &ClassPrototypes,
    quick: bool,
) -> Result<ValidationSummary> {
    let device = driver.device().clone();
    let mut loss_sum = 0.0f64;
    let mut batches = 0usize;
    let mut correct = 0usize;
    let mut records = 0usize;
    let mut example = None;

    source.reset_cursor();
    loop {
        let (minibatch, is_final) = if quick {
            (Some(source.get_random_minibatch()?), true)
        } else {
            source.get_sequential_minibatch()?
        };
        let Some(minibatch) = minibatch else {
            break;
        };
        let batch = source.format_minibatch_data(&minibatch, &device)?;
        let out = driver.step(&batch, false, None)?;
        loss_sum += out.loss as f64;
        batches += 1;

        let sampled = out
            .sampled
            .ok_or_else(|| anyhow!("inference step returned no samples"))?
            .to_vec3::<f32>()?;
        let votes = sample_votes(&minibatch.rows, &sampled, prototypes);
        for (i, (row, vote)) in minibatch.rows.iter().zip(votes).enumerate() {
            if row.is_filler {
                continue;
            }
            records += 1;
            if vote == Some(row.record.class_idx) {
                correct += 1;
            }
            if example.is_none() {
                example = Some(TrackPrediction::from_sampled(&row.record, &sampled[i]));
            }
        }
        if is_final {
            break;
        }
    }
    source.reset_cursor();

    Ok(ValidationSummary {
        loss: if batches > 0 { (loss_sum / batches as f64) as f32 } else { f32::NAN },
        class_accuracy: if records > 0 { correct as f64 / records as f64 } else { 0.0 },
        records,
        example,
    })
}

// ---------------------------------------------------------------------------
// Trajectory predictions
// ---------------------------------------------------------------------------

/// Resolved (dominant-mean) trajectory for one record per track, the one
/// nearest `reference_distance`.
pub fn collect_predictions<S: BatchSource + ?Sized>(
    driver: &mut StepDriver,
    source: &mut S,
    reference_distance: f32,
) -> Result<Vec<TrackPrediction>> {
    let device = driver.device().clone();
    let mut guard = FilterGuard::new(source);
    guard.set_distance_threshold_ranges(None);
    guard.set_distance_threshold(Some(reference_distance));

    let mut out = Vec::new();
    loop {
        let (minibatch, is_final) = guard.get_sequential_minibatch()?;
        let Some(minibatch) = minibatch else {
            break;
        };
        let batch = guard.format_minibatch_data(&minibatch, &device)?;
        let step = driver.step(&batch, false, None)?;
        let resolved = step
            .mixtures
            .ok_or_else(|| anyhow!("inference step returned no mixtures"))?
            .to_vec3::<f32>()?;
        for (row, traj) in minibatch.rows.iter().zip(&resolved) {
            if !row.is_filler {
                out.push(TrackPrediction::from_sampled(&row.record, traj));
            }
        }
        if is_final {
            break;
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Earliest perfect distance
// ---------------------------------------------------------------------------

/// Per class, the smallest threshold from which every later threshold has
/// only correctly classified rows. The largest threshold when the last one
/// is not perfect or fewer than two are.
pub fn earliest_perfect_distance(table: &ResultTable) -> BTreeMap<String, f32> {
    let thresholds = table.thresholds();
    let Some(&max) = thresholds.last() else {
        return BTreeMap::new();
    };
    let delta = thresholds.windows(2).next().map(|w| w[1] - w[0]);
    let same = |a: f32, b: f32| (a - b).abs() < DISTANCE_EPS;

    let classes: BTreeSet<(usize, &str)> = table
        .rows
        .iter()
        .map(|r| (r.true_class, r.class_name.as_str()))
        .collect();
    classes
        .into_iter()
        .map(|(class, name)| {
            let imperfect: Vec<f32> = table
                .rows
                .iter()
                .filter(|r| r.true_class == class && !r.is_correct())
                .map(|r| r.d_thresh)
                .collect();
            let perfect: Vec<f32> = thresholds
                .iter()
                .copied()
                .filter(|&t| !imperfect.iter().any(|&d| same(d, t)))
                .collect();
            let earliest = match (perfect.last(), delta) {
                (Some(&last), Some(delta)) if perfect.len() >= 2 && same(last, max) => {
                    let mut start = perfect[0];
                    for i in (1..perfect.len()).rev() {
                        if !same(perfect[i] - perfect[i - 1], delta) {
                            start = perfect[i];
                            break;
                        }
                    }
                    start
                }
                _ => max,
            };
            (name.to_string(), earliest)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{DistanceFilter, Minibatch};
    use anyhow::bail;
    use candle_core::Device;

    /// Source that always fails after the filter is set.
    struct Broken {
        filter: DistanceFilter,
    }

    impl BatchSource for Broken {
        fn batch_size(&self) -> usize {
            1
        }
        fn get_sequential_minibatch(&mut self) -> Result<(Option<Minibatch>, bool)> {
            bail!("disk on fire")
        }
        fn reset_cursor(&mut self) {}
        fn get_random_minibatch(&mut self) -> Result<Minibatch> {
            bail!("disk on fire")
        }
        fn set_distance_threshold(&mut self, threshold: Option<f32>) {
            match threshold {
                Some(d) => self.filter = DistanceFilter::Threshold(d),
                None if matches!(self.filter, DistanceFilter::Threshold(_)) => self.filter = DistanceFilter::None,
                None => {}
            }
        }
        fn set_distance_threshold_ranges(&mut self, thresholds: Option<Vec<f32>>) {
            match thresholds {
                Some(ts) => self.filter = DistanceFilter::Ranges(ts),
                None if matches!(self.filter, DistanceFilter::Ranges(_)) => self.filter = DistanceFilter::None,
                None => {}
            }
        }
        fn distance_filter(&self) -> &DistanceFilter {
            &self.filter
        }
    }

    fn row(class: usize, predicted: Option<usize>, d: f32) -> ResultRow {
        ResultRow {
            record_id: 0,
            track_idx: 0,
            class_name: format!("c{class}"),
            true_class: class,
            ground_truth: vec![],
            votes: vec![],
            predicted_class: predicted,
            d_thresh: d,
            distance: d,
        }
    }

    #[test]
    fn test_guard_resets_filter_on_error() -> Result<()> {
        let mut source = Broken {
            filter: DistanceFilter::Threshold(3.0),
        };
        let mut driver = StepDriver::new(crate::config::ModelConfig::tiny(), &Device::Cpu)?;
        let protos = ClassPrototypes {
            names: vec!["a".into(), "b".into()],
            directions: vec![[1.0, 0.0], [0.0, 1.0]],
        };
        assert!(evaluate(&mut driver, &mut source, &[0.0, 1.0], &protos).is_err());
        assert_eq!(source.distance_filter(), &DistanceFilter::None);
        Ok(())
    }

    #[test]
    fn test_argmax_votes() {
        assert_eq!(argmax_votes(&[0, 3, 1]), Some(1));
        assert_eq!(argmax_votes(&[2, 2]), Some(0));
        assert_eq!(argmax_votes(&[0, 0]), None);
        assert_eq!(argmax_votes(&[]), None);
    }

    #[test]
    fn test_earliest_perfect_distance() {
        let mut rows = Vec::new();
        for d in [0.0f32, 1.0, 2.0, 3.0, 4.0] {
            // class 0 wrong at 0 and 2, right from 3 on
            rows.push(row(0, Some(if d == 0.0 || d == 2.0 { 1 } else { 0 }), d));
            // class 1 right everywhere
            rows.push(row(1, Some(1), d));
        }
        // class 2 wrong at the last threshold
        rows.push(row(2, Some(2), 0.0));
        rows.push(row(2, None, 4.0));
        let table = ResultTable {
            class_names: vec!["c0".into(), "c1".into(), "c2".into()],
            num_samples: 4,
            rows,
        };
        let best = earliest_perfect_distance(&table);
        assert_eq!(best["c0"], 3.0);
        assert_eq!(best["c1"], 0.0);
        assert_eq!(best["c2"], 4.0);
    }
}
