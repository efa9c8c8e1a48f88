use anyhow::{ensure, Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::ModelConfig;
use crate::error::ConfigError;
use crate::mdn::compute_derivative;
use crate::model::ModelBatch;
use crate::scaling::Scaling;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One observed/future window cut from a track, positions in real-world units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub track_idx: usize,
    pub class_idx: usize,
    pub class_name: String,
    /// Signed distance of the last observation from the reference point.
    pub distance: f32,
    /// observation_steps rows of input_size features
    pub observations: Vec<Vec<f32>>,
    /// prediction_steps rows of input_size features
    pub future: Vec<Vec<f32>>,
    /// true where the future step is past the end of the track
    pub future_padding: Vec<bool>,
}

impl TrackRecord {
    pub fn one_hot(&self, num_classes: usize) -> Vec<f32> {
        (0..num_classes)
            .map(|k| if k == self.class_idx { 1.0 } else { 0.0 })
            .collect()
    }

    pub fn last_observed_position(&self) -> Option<[f32; 2]> {
        self.observations.last().map(|r| [r[0], r[1]])
    }

    /// Future positions that are not padding.
    pub fn real_future(&self) -> Vec<[f32; 2]> {
        self.future
            .iter()
            .zip(&self.future_padding)
            .filter(|&(_, &pad)| !pad)
            .map(|(r, _)| [r[0], r[1]])
            .collect()
    }

    /// Heading (radians) of the last observed displacement; 0 when stationary.
    pub fn observed_heading(&self) -> f32 {
        let n = self.observations.len();
        if n < 2 {
            return 0.0;
        }
        let (a, b) = (&self.observations[n - 2], &self.observations[n - 1]);
        let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
        if dx.hypot(dy) < 1e-6 {
            0.0
        } else {
            dy.atan2(dx)
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub record: Arc<TrackRecord>,
    /// Filler row that only squares up the final batch. Never scored.
    pub is_filler: bool,
    /// Distance bucket the row was selected for, if a filter was active.
    pub d_thresh: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct Minibatch {
    pub rows: Vec<BatchRow>,
}

impl Minibatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Pack rows into batch-major tensors.
    pub fn to_model_batch(&self, device: &Device) -> Result<ModelBatch> {
        ensure!(!self.rows.is_empty(), "cannot format an empty minibatch");
        let first = &self.rows[0].record;
        let (obs, pred) = (first.observations.len(), first.future.len());
        ensure!(obs > 0 && pred > 0, "record {} has no steps", first.track_idx);
        let width = first.observations[0].len();
        let b = self.rows.len();

        let mut observations: Vec<f32> = Vec::with_capacity(b * obs * width);
        let mut future: Vec<f32> = Vec::with_capacity(b * pred * width);
        let mut padding = Vec::with_capacity(b * pred);
        let mut weights = Vec::with_capacity(b);
        for row in &self.rows {
            let r = &row.record;
            ensure!(
                r.observations.len() == obs && r.future.len() == pred && r.future_padding.len() == pred,
                "record of track {} has shape ({}, {}), batch expects ({obs}, {pred})",
                r.track_idx,
                r.observations.len(),
                r.future.len()
            );
            for step in r.observations.iter().chain(&r.future) {
                ensure!(step.len() == width, "track {} has a row of width {}", r.track_idx, step.len());
            }
            observations.extend(r.observations.iter().flatten());
            future.extend(r.future.iter().flatten());
            padding.extend(r.future_padding.iter().map(|&p| if p { 1.0f32 } else { 0.0 }));
            weights.push(if row.is_filler { 0.0f32 } else { 1.0 });
        }
        Ok(ModelBatch {
            observations: Tensor::from_vec(observations, (b, obs, width), device)?,
            future: Tensor::from_vec(future, (b, pred, width), device)?,
            padding: Tensor::from_vec(padding, (b, pred), device)?,
            record_weights: Tensor::from_vec(weights, b, device)?,
        })
    }
}

// ---------------------------------------------------------------------------
// BatchSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub enum DistanceFilter {
    #[default]
    None,
    /// Per track, the record nearest this distance.
    Threshold(f32),
    /// Per track and threshold, the record nearest that threshold.
    Ranges(Vec<f32>),
}

/// Supplies minibatches for training and evaluation.
///
/// Sequential iteration is exhaustive and ends with a final flag. The last
/// batch is squared up with filler rows flagged `is_filler`.
pub trait BatchSource {
    fn batch_size(&self) -> usize;

    /// Next batch in order and whether it was the last one. `None` when
    /// nothing is left to yield.
    fn get_sequential_minibatch(&mut self) -> Result<(Option<Minibatch>, bool)>;

    fn reset_cursor(&mut self);

    fn get_random_minibatch(&mut self) -> Result<Minibatch>;

    /// `None` clears a single-threshold filter.
    fn set_distance_threshold(&mut self, threshold: Option<f32>);

    /// `None` clears a range filter.
    fn set_distance_threshold_ranges(&mut self, thresholds: Option<Vec<f32>>);

    fn distance_filter(&self) -> &DistanceFilter;

    fn format_minibatch_data(&self, batch: &Minibatch, device: &Device) -> Result<ModelBatch> {
        batch.to_model_batch(device)
    }
}

// ---------------------------------------------------------------------------
// TrackPool
// ---------------------------------------------------------------------------

/// In-memory batch source over a fixed set of records.
pub struct TrackPool {
    records: Vec<Arc<TrackRecord>>,
    batch_size: usize,
    filter: DistanceFilter,
    /// (record index, bucket) in iteration order for the current filter.
    view: Vec<(usize, Option<f32>)>,
    cursor: usize,
    rng: StdRng,
}

impl TrackPool {
    pub fn new(records: Vec<TrackRecord>, batch_size: usize, seed: u64) -> Result<Self> {
        ensure!(batch_size > 0, ConfigError::Zero { field: "batch_size" });
        let mut pool = Self {
            records: records.into_iter().map(Arc::new).collect(),
            batch_size,
            filter: DistanceFilter::None,
            view: Vec::new(),
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        pool.rebuild_view();
        Ok(pool)
    }

    pub fn load_json(path: impl AsRef<Path>, batch_size: usize, seed: u64) -> Result<Self> {
        Self::new(load_tracks(path)?, batch_size, seed)
    }

    pub fn records(&self) -> &[Arc<TrackRecord>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fit scaling over every observed step and every real future step.
    pub fn fit_scaling(&self, width: usize) -> Result<Scaling, ConfigError> {
        let rows = self.records.iter().flat_map(|r| {
            r.observations.iter().chain(
                r.future
                    .iter()
                    .zip(&r.future_padding)
                    .filter(|&(_, &pad)| !pad)
                    .map(|(row, _)| row),
            )
        });
        Scaling::fit(rows.map(|r| r.as_slice()), width)
    }

    fn rebuild_view(&mut self) {
        self.cursor = 0;
        let by_track = || {
            let mut tracks: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for (i, r) in self.records.iter().enumerate() {
                tracks.entry(r.track_idx).or_default().push(i);
            }
            tracks
        };
        let nearest = |idxs: &[usize], d: f32| -> Option<usize> {
            idxs.iter().copied().min_by(|&a, &b| {
                let da = (self.records[a].distance - d).abs();
                let db = (self.records[b].distance - d).abs();
                da.total_cmp(&db)
            })
        };
        self.view = match &self.filter {
            DistanceFilter::None => (0..self.records.len()).map(|i| (i, None)).collect(),
            DistanceFilter::Threshold(d) => by_track()
                .values()
                .filter_map(|idxs| nearest(idxs, *d).map(|i| (i, Some(*d))))
                .collect(),
            DistanceFilter::Ranges(thresholds) => {
                let mut sorted = thresholds.clone();
                sorted.sort_by(f32::total_cmp);
                sorted.dedup();
                // half a bucket; a lone threshold falls back to the record spacing
                let step = match sorted.windows(2).map(|w| w[1] - w[0]).reduce(f32::min) {
                    Some(gap) => Some(gap),
                    None => self.record_spacing(),
                };
                let tolerance = step.map_or(0.0, |s| s / 2.0);
                let tracks = by_track();
                let mut view = Vec::new();
                for &t in &sorted {
                    for idxs in tracks.values() {
                        if let Some(i) = nearest(idxs, t) {
                            if (self.records[i].distance - t).abs() <= tolerance + 1e-6 {
                                view.push((i, Some(t)));
                            }
                        }
                    }
                }
                view
            }
        };
    }

    /// Smallest positive gap between distances of records on the same track.
    fn record_spacing(&self) -> Option<f32> {
        let mut by_track: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
        for r in &self.records {
            by_track.entry(r.track_idx).or_default().push(r.distance);
        }
        by_track
            .values_mut()
            .flat_map(|ds| {
                ds.sort_by(f32::total_cmp);
                ds.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>()
            })
            .filter(|&gap| gap > 1e-6)
            .reduce(f32::min)
    }

    fn row(&self, (idx, d_thresh): (usize, Option<f32>), is_filler: bool) -> BatchRow {
        BatchRow {
            record: Arc::clone(&self.records[idx]),
            is_filler,
            d_thresh,
        }
    }
}

impl BatchSource for TrackPool {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn get_sequential_minibatch(&mut self) -> Result<(Option<Minibatch>, bool)> {
        if self.cursor >= self.view.len() {
            return Ok((None, true));
        }
        let end = (self.cursor + self.batch_size).min(self.view.len());
        let mut rows: Vec<BatchRow> = self.view[self.cursor..end]
            .iter()
            .map(|&entry| self.row(entry, false))
            .collect();
        let filler = self.view[self.cursor];
        while rows.len() < self.batch_size {
            rows.push(self.row(filler, true));
        }
        self.cursor = end;
        Ok((Some(Minibatch { rows }), self.cursor >= self.view.len()))
    }

    fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    fn get_random_minibatch(&mut self) -> Result<Minibatch> {
        ensure!(!self.view.is_empty(), "no records match filter {:?}", self.filter);
        let mut rows = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let entry = self.view[self.rng.gen_range(0..self.view.len())];
            rows.push(self.row(entry, false));
        }
        Ok(Minibatch { rows })
    }

    fn set_distance_threshold(&mut self, threshold: Option<f32>) {
        match threshold {
            Some(d) => self.filter = DistanceFilter::Threshold(d),
            None if matches!(self.filter, DistanceFilter::Threshold(_)) => self.filter = DistanceFilter::None,
            None => return,
        }
        self.rebuild_view();
    }

    fn set_distance_threshold_ranges(&mut self, thresholds: Option<Vec<f32>>) {
        match thresholds {
            Some(ts) => self.filter = DistanceFilter::Ranges(ts),
            None if matches!(self.filter, DistanceFilter::Ranges(_)) => self.filter = DistanceFilter::None,
            None => return,
        }
        self.rebuild_view();
    }

    fn distance_filter(&self) -> &DistanceFilter {
        &self.filter
    }
}

/// Splits records by track: every `every`-th track goes to the second set.
pub fn split_by_track(records: Vec<TrackRecord>, every: usize) -> (Vec<TrackRecord>, Vec<TrackRecord>) {
    let every = every.max(2);
    records.into_iter().partition(|r| r.track_idx % every != 0)
}

pub fn load_tracks(path: impl AsRef<Path>) -> Result<Vec<TrackRecord>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading tracks {}", path.display()))?;
    let records: Vec<TrackRecord> = serde_json::from_str(&text)
        .with_context(|| format!("parsing tracks {}", path.display()))?;
    tracing::info!(records = records.len(), path = %path.display(), "loaded tracks");
    Ok(records)
}

pub fn save_tracks(records: &[TrackRecord], path: impl AsRef<Path>) -> Result<()> {
    std::fs::write(path, serde_json::to_string(records)?)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Class prototypes
// ---------------------------------------------------------------------------

/// Per-class mean direction of travel over the prediction window, expressed
/// in the frame of the last observed heading. A trajectory belongs to the
/// class whose direction is closest by cosine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPrototypes {
    pub names: Vec<String>,
    pub directions: Vec<[f32; 2]>,
}

fn relative_direction(origin: [f32; 2], heading: f32, endpoint: [f32; 2]) -> Option<[f32; 2]> {
    let (dx, dy) = (endpoint[0] - origin[0], endpoint[1] - origin[1]);
    let (s, c) = (-heading).sin_cos();
    let (rx, ry) = (dx * c - dy * s, dx * s + dy * c);
    let norm = rx.hypot(ry);
    (norm > 1e-6).then(|| [rx / norm, ry / norm])
}

impl ClassPrototypes {
    pub fn fit(records: &[Arc<TrackRecord>], num_classes: usize) -> Result<Self> {
        ensure!(num_classes > 0, ConfigError::Zero { field: "num_classes" });
        let mut sums = vec![[0.0f32; 2]; num_classes];
        let mut names: Vec<Option<String>> = vec![None; num_classes];
        for r in records.iter().filter(|r| r.class_idx < num_classes) {
            let future = r.real_future();
            let (Some(origin), Some(&end)) = (r.last_observed_position(), future.last()) else {
                continue;
            };
            if let Some(d) = relative_direction(origin, r.observed_heading(), end) {
                sums[r.class_idx][0] += d[0];
                sums[r.class_idx][1] += d[1];
            }
            if names[r.class_idx].is_none() {
                names[r.class_idx] = Some(r.class_name.clone());
            }
        }
        let directions = sums
            .iter()
            .map(|s| {
                let n = s[0].hypot(s[1]);
                if n > 1e-6 { [s[0] / n, s[1] / n] } else { [0.0, 0.0] }
            })
            .collect();
        let names = names
            .into_iter()
            .enumerate()
            .map(|(k, n)| n.unwrap_or_else(|| format!("class_{k}")))
            .collect();
        Ok(Self { names, directions })
    }

    pub fn num_classes(&self) -> usize {
        self.directions.len()
    }

    /// Class of a predicted trajectory, `None` when it does not move.
    pub fn classify(&self, record: &TrackRecord, endpoint: [f32; 2]) -> Option<usize> {
        let origin = record.last_observed_position()?;
        let d = relative_direction(origin, record.observed_heading(), endpoint)?;
        self.directions
            .iter()
            .enumerate()
            .map(|(k, p)| (k, p[0] * d[0] + p[1] * d[1]))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(k, _)| k)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading prototypes {}", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ---------------------------------------------------------------------------
// Synthetic tracks
// ---------------------------------------------------------------------------

/// Window offsets cut from each synthetic track.
const SYNTH_OFFSETS: [usize; 4] = [0, 2, 4, 6];
/// Heading change per step after the reference line, per class rank.
const SYNTH_TURN_RATE: f32 = 0.08;

/// Tracks that approach the line x=0 heading +x, then turn at a class-specific
/// rate. Some tracks end early so their last windows carry padding.
pub fn synthetic_tracks(cfg: &ModelConfig, tracks: usize, seed: u64) -> Vec<TrackRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (obs, pred) = (cfg.observation_steps, cfg.prediction_steps);
    let total = obs + pred + SYNTH_OFFSETS[SYNTH_OFFSETS.len() - 1];
    let centre = (cfg.num_classes as f32 - 1.0) / 2.0;
    let mut out = Vec::new();

    for track_idx in 0..tracks {
        let class_idx = track_idx % cfg.num_classes.max(1);
        let rate = (class_idx as f32 - centre) * SYNTH_TURN_RATE;
        let speed = 0.8 + 0.4 * rng.gen::<f32>();
        let mut pos = [-(obs as f32) * speed - 5.0 * rng.gen::<f32>(), rng.sample::<f32, _>(StandardNormal)];
        let mut heading = 0.0f32;
        let length = total - (track_idx % 3) * (pred / 2);

        let mut rows: Vec<Vec<f32>> = Vec::with_capacity(total);
        for step in 0..total {
            if step > 0 && step < length {
                if pos[0] > 0.0 {
                    heading += rate;
                }
                let jitter: f32 = rng.sample(StandardNormal);
                pos[0] += speed * heading.cos() + 0.02 * jitter;
                pos[1] += speed * heading.sin() + 0.02 * jitter;
            }
            let previous = rows.last().cloned().unwrap_or_else(|| {
                let mut first = vec![0.0; cfg.input_size];
                first[..2].copy_from_slice(&pos);
                first
            });
            rows.push(compute_derivative(&previous, pos, &cfg.input_columns, 0.0, cfg.subsample));
        }

        for &offset in &SYNTH_OFFSETS {
            if offset + obs >= length {
                continue;
            }
            out.push(TrackRecord {
                track_idx,
                class_idx,
                class_name: format!("turn_{class_idx}"),
                distance: rows[offset + obs - 1][0],
                observations: rows[offset..offset + obs].to_vec(),
                future: rows[offset + obs..offset + obs + pred].to_vec(),
                future_padding: (offset + obs..offset + obs + pred).map(|s| s >= length).collect(),
            });
        }
    }
    out
}
