// Decoder loop: one explicit state value threaded through `DecoderLoop::step`.
//
//   Init --init()--> Step(0) --step()--> Step(1) ... Step(P-1) --step()--> Done
//
// Every step writes slot t of sampled/losses/mixtures/padding and slot t+1 of
// lagged. Slot 0 of lagged is the last real observation, written by init().

use anyhow::{bail, ensure, Result};
use candle_core::{DType, IndexOp, Module, Tensor, D};
use rand::Rng;

use crate::cell::CellState;
use crate::config::FeedbackPolicy;
use crate::error::{ConfigError, SlotError};
use crate::mdn::{compute_derivative, mixture_nll, resolve_batch, sample_batch};
use crate::model::Seq2SeqMdn;

/// Padding logit weights below this skip the padding classifier entirely.
const LOGIT_WEIGHT_EPS: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Write-once slot array
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SlotArray<T> {
    name: &'static str,
    slots: Vec<Option<T>>,
}

impl<T> SlotArray<T> {
    pub fn new(name: &'static str, len: usize) -> Self {
        Self {
            name,
            slots: (0..len).map(|_| None).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn written(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn write(&mut self, index: usize, value: T) -> Result<(), SlotError> {
        let len = self.slots.len();
        let slot = self.slots.get_mut(index).ok_or(SlotError::OutOfBounds {
            array: self.name,
            index,
            len,
        })?;
        if slot.is_some() {
            return Err(SlotError::Overwrite { array: self.name, index });
        }
        *slot = Some(value);
        Ok(())
    }

    pub fn read(&self, index: usize) -> Result<&T, SlotError> {
        match self.slots.get(index) {
            Some(Some(v)) => Ok(v),
            Some(None) => Err(SlotError::Unwritten { array: self.name, index }),
            None => Err(SlotError::OutOfBounds {
                array: self.name,
                index,
                len: self.slots.len(),
            }),
        }
    }

    /// All slots, in time order. Fails on the first unwritten slot.
    pub fn into_vec(self) -> Result<Vec<T>, SlotError> {
        let name = self.name;
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, s)| s.ok_or(SlotError::Unwritten { array: name, index }))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPhase {
    Init,
    Step(usize),
    Done,
}

pub struct DecoderState {
    pub phase: DecoderPhase,
    cell: CellState,
    /// Embedded input for the next cell call.
    next_input: Tensor,
    /// (batch, input_size) real units: sampled position with derived features.
    pub sampled: SlotArray<Tensor>,
    /// (batch,) masked per-row loss.
    pub losses: SlotArray<Tensor>,
    /// (batch, input_size) real units; P+1 slots, slot t is the input fed at step t.
    pub lagged: SlotArray<Tensor>,
    /// (batch, 2) dominant-component mean, real units.
    pub mixtures: SlotArray<Tensor>,
    /// (batch, 2) padding classifier logits, zeros when the head is off.
    pub padding: SlotArray<Tensor>,
}

/// Loop results, transposed to batch-major.
pub struct DecoderOutput {
    /// (batch, P, input_size)
    pub sampled: Tensor,
    /// (batch, P)
    pub losses: Tensor,
    /// (batch, P, 2)
    pub mixtures: Tensor,
    /// (batch, P, 2)
    pub padding_logits: Tensor,
    pub final_state: CellState,
}

impl DecoderState {
    pub fn finish(self) -> Result<DecoderOutput> {
        ensure!(
            self.phase == DecoderPhase::Done,
            "decoder finished in phase {:?}",
            self.phase
        );
        let stack = |slots: SlotArray<Tensor>| -> Result<Tensor> {
            Ok(Tensor::stack(&slots.into_vec()?, 1)?)
        };
        Ok(DecoderOutput {
            sampled: stack(self.sampled)?,
            losses: stack(self.losses)?,
            mixtures: stack(self.mixtures)?,
            padding_logits: stack(self.padding)?,
            final_state: self.cell,
        })
    }
}

/// Per-pass data the loop reads but never writes.
pub struct DecoderTargets<'a> {
    /// (batch, P, input_size) ground-truth future, real units.
    pub future: &'a Tensor,
    /// (batch, P) 1.0 where the step is padding.
    pub padding: Option<&'a Tensor>,
    /// (batch,) per-record loss weight.
    pub record_weights: Option<&'a Tensor>,
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub struct DecoderLoop<'m> {
    model: &'m Seq2SeqMdn,
    policy: FeedbackPolicy,
    prediction_steps: usize,
    temperature: f64,
    train: bool,
}

impl<'m> DecoderLoop<'m> {
    /// Fails with a [`ConfigError`] when the policy needs scaling that was never set.
    pub fn new(model: &'m Seq2SeqMdn, train: bool) -> Result<Self, ConfigError> {
        model.check_ready()?;
        let cfg = &model.config;
        Ok(Self {
            model,
            policy: cfg.feedback,
            prediction_steps: cfg.prediction_steps,
            temperature: cfg.sample_temperature,
            train,
        })
    }

    /// Init -> Step(0): seed the cell from the encoder, lagged[0] from the last observation.
    pub fn init(&self, encoder_state: CellState, last_observation: &Tensor) -> Result<DecoderState> {
        let p = self.prediction_steps;
        let mut lagged = SlotArray::new("lagged", p + 1);
        lagged.write(0, last_observation.clone())?;
        Ok(DecoderState {
            phase: DecoderPhase::Step(0),
            cell: encoder_state,
            next_input: self.model.embed(last_observation, self.train)?,
            sampled: SlotArray::new("sampled", p),
            losses: SlotArray::new("losses", p),
            lagged,
            mixtures: SlotArray::new("mixtures", p),
            padding: SlotArray::new("padding", p),
        })
    }

    /// Step(t) -> Step(t+1) or Done.
    pub fn step<R: Rng + ?Sized>(
        &self,
        mut state: DecoderState,
        targets: &DecoderTargets<'_>,
        rng: &mut R,
    ) -> Result<DecoderState> {
        let t = match state.phase {
            DecoderPhase::Step(t) => t,
            phase => bail!("decoder step called in phase {phase:?}"),
        };
        let model = self.model;
        let cfg = &model.config;
        let scaling = model.scaling();
        let device = state.next_input.device().clone();

        let (output, cell) = model.cells().step(&state.next_input, &state.cell, self.train)?;
        let projected = model.mdn_projection().forward(&output)?;

        // sample -> real units
        let samples: Vec<[f32; 2]> = sample_batch(&projected, cfg.num_mixtures, self.temperature, rng)?
            .into_iter()
            .map(|p| scaling.upscale_point(p))
            .collect();
        let previous = state.lagged.read(t)?.to_vec2::<f32>()?;
        let reconstructed: Vec<Vec<f32>> = samples
            .iter()
            .zip(&previous)
            .map(|(&point, prev)| match self.policy {
                FeedbackPolicy::Derivative => compute_derivative(
                    prev,
                    point,
                    &cfg.input_columns,
                    cfg.velocity_threshold,
                    cfg.subsample,
                ),
                _ => widen(point, cfg.input_size),
            })
            .collect();
        let batch = samples.len();
        let sampled = rows_to_tensor(&reconstructed, batch, cfg.input_size, &device)?;

        let target = targets.future.i((.., t, ..))?.contiguous()?;
        let next_datapoint = match self.policy {
            FeedbackPolicy::ZeroFeed => Tensor::zeros((batch, cfg.input_size), DType::F32, &device)?,
            FeedbackPolicy::RawSample | FeedbackPolicy::Derivative => sampled.clone(),
            FeedbackPolicy::TeacherForced => target.clone(),
        };
        let next_input = model.embed(&next_datapoint, self.train)?;

        let mut loss = mixture_nll(&scaling.normalize(&target)?, &projected, cfg.num_mixtures)?;
        if let Some(w) = targets.record_weights {
            loss = (loss * w)?;
        }
        let padding_logits = match targets.padding {
            Some(pad) => {
                let pad_t = pad.i((.., t))?.contiguous()?;
                // real steps weigh 1, padded steps weigh the floor
                let floor = cfg.padding_loss_mixture_weight;
                let weight = ((&pad_t * (floor - 1.0))? + 1.0)?;
                loss = (loss * weight)?;
                match model.padding_projection() {
                    Some(head) => {
                        let logits = head.forward(&output)?;
                        if cfg.padding_loss_logit_weight.abs() > LOGIT_WEIGHT_EPS {
                            let mut ce = padding_cross_entropy(&logits, &pad_t)?;
                            if let Some(w) = targets.record_weights {
                                ce = (ce * w)?;
                            }
                            let scale = cfg.padding_loss_logit_weight / self.prediction_steps as f64;
                            loss = (loss + (ce * scale)?)?;
                        }
                        logits
                    }
                    None => Tensor::zeros((batch, 2), DType::F32, &device)?,
                }
            }
            None => match model.padding_projection() {
                Some(head) => head.forward(&output)?,
                None => Tensor::zeros((batch, 2), DType::F32, &device)?,
            },
        };

        let resolved = resolve_batch(&projected, cfg.num_mixtures, scaling)?;
        let resolved: Vec<Vec<f32>> = resolved.iter().map(|p| p.to_vec()).collect();

        state.sampled.write(t, sampled)?;
        state.losses.write(t, loss)?;
        state.lagged.write(t + 1, next_datapoint)?;
        state.mixtures.write(t, rows_to_tensor(&resolved, batch, 2, &device)?)?;
        state.padding.write(t, padding_logits)?;
        state.cell = cell;
        state.next_input = next_input;
        state.phase = if t + 1 >= self.prediction_steps {
            DecoderPhase::Done
        } else {
            DecoderPhase::Step(t + 1)
        };
        Ok(state)
    }

    /// Always exactly `prediction_steps` iterations; padding only masks the loss.
    pub fn run<R: Rng + ?Sized>(
        &self,
        mut state: DecoderState,
        targets: &DecoderTargets<'_>,
        rng: &mut R,
    ) -> Result<DecoderOutput> {
        while state.phase != DecoderPhase::Done {
            state = self.step(state, targets, rng)?;
        }
        state.finish()
    }
}

fn widen(point: [f32; 2], width: usize) -> Vec<f32> {
    let mut row = vec![0.0f32; width];
    row[..2].copy_from_slice(&point);
    row
}

fn rows_to_tensor(
    rows: &[Vec<f32>],
    batch: usize,
    width: usize,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (batch, width), device).map_err(Into::into)
}

/// Two-class softmax cross-entropy against the padding flag. (batch, 2), (batch,) -> (batch,)
fn padding_cross_entropy(logits: &Tensor, is_padding: &Tensor) -> Result<Tensor> {
    let max = logits.max_keepdim(D::Minus1)?;
    let shifted = logits.broadcast_sub(&max)?;
    let lse = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    let log_probs = shifted.broadcast_sub(&lse)?;
    let real = (is_padding.neg()? + 1.0)?;
    let labels = Tensor::stack(&[real, is_padding.clone()], 1)?;
    (labels * log_probs)?.sum(1)?.neg().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use candle_core::Device;
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model_with(cfg: ModelConfig) -> Result<(Seq2SeqMdn, VarMap)> {
        let varmap = VarMap::new();
        let mut model = Seq2SeqMdn::new(cfg, &varmap, &Device::Cpu)?;
        let width = model.config.input_size;
        model.set_normalization(vec![0.0; width], vec![1.0; width])?;
        Ok((model, varmap))
    }

    fn run_loop(model: &Seq2SeqMdn, batch: usize, with_padding: bool) -> Result<DecoderState> {
        let cfg = &model.config;
        let device = Device::Cpu;
        let future = Tensor::randn(0f32, 1.0, (batch, cfg.prediction_steps, cfg.input_size), &device)?;
        let padding = Tensor::zeros((batch, cfg.prediction_steps), DType::F32, &device)?;
        let targets = DecoderTargets {
            future: &future,
            padding: if with_padding { Some(&padding) } else { None },
            record_weights: None,
        };
        let dl = DecoderLoop::new(model, false)?;
        let enc = model.cells().zero_state(batch, &device)?;
        let last = Tensor::randn(0f32, 1.0, (batch, cfg.input_size), &device)?;
        let mut state = dl.init(enc, &last)?;
        let mut rng = StdRng::seed_from_u64(1);
        while state.phase != DecoderPhase::Done {
            state = dl.step(state, &targets, &mut rng)?;
        }
        Ok(state)
    }

    #[test]
    fn test_slot_array_write_once() {
        let mut a: SlotArray<u32> = SlotArray::new("a", 2);
        assert_eq!(a.write(0, 1), Ok(()));
        assert_eq!(a.write(0, 2), Err(SlotError::Overwrite { array: "a", index: 0 }));
        assert_eq!(a.write(2, 2), Err(SlotError::OutOfBounds { array: "a", index: 2, len: 2 }));
        assert_eq!(a.read(1), Err(SlotError::Unwritten { array: "a", index: 1 }));
        assert!(a.into_vec().is_err());
    }

    #[test]
    fn test_every_slot_written_once_for_any_horizon() -> Result<()> {
        for steps in [1usize, 5, 50] {
            let cfg = ModelConfig {
                prediction_steps: steps,
                ..ModelConfig::tiny()
            };
            let (model, _vm) = model_with(cfg)?;
            let state = run_loop(&model, 3, true)?;
            assert_eq!(state.sampled.written(), steps);
            assert_eq!(state.losses.written(), steps);
            assert_eq!(state.mixtures.written(), steps);
            assert_eq!(state.padding.written(), steps);
            assert_eq!(state.lagged.written(), steps + 1);

            let out = state.finish()?;
            assert_eq!(out.sampled.dims3()?, (3, steps, 4));
            assert_eq!(out.losses.dims2()?, (3, steps));
            assert_eq!(out.mixtures.dims3()?, (3, steps, 2));
            assert_eq!(out.padding_logits.dims3()?, (3, steps, 2));
        }
        Ok(())
    }

    #[test]
    fn test_step_after_done_is_error() -> Result<()> {
        let (model, _vm) = model_with(ModelConfig::tiny())?;
        let state = run_loop(&model, 2, false)?;
        assert_eq!(state.phase, DecoderPhase::Done);
        let future = Tensor::zeros((2, 5, 4), DType::F32, &Device::Cpu)?;
        let targets = DecoderTargets { future: &future, padding: None, record_weights: None };
        let dl = DecoderLoop::new(&model, false)?;
        let mut rng = StdRng::seed_from_u64(0);
        assert!(dl.step(state, &targets, &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn test_unscaled_derivative_feed_rejected_before_loop() -> Result<()> {
        let varmap = VarMap::new();
        let model = Seq2SeqMdn::new(ModelConfig::tiny(), &varmap, &Device::Cpu)?;
        assert_eq!(
            DecoderLoop::new(&model, false).err(),
            Some(ConfigError::ScalingNotInitialized { policy: "derivative" })
        );
        Ok(())
    }

    #[test]
    fn test_zero_feed_lagged_inputs_are_zero() -> Result<()> {
        let cfg = ModelConfig {
            feedback: FeedbackPolicy::ZeroFeed,
            ..ModelConfig::tiny()
        };
        let (model, _vm) = model_with(cfg)?;
        let state = run_loop(&model, 2, false)?;
        for t in 1..=5 {
            let sum = state.lagged.read(t)?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert_eq!(sum, 0.0, "lagged[{t}] should be zeros");
        }
        Ok(())
    }

    #[test]
    fn test_padding_floor_suppresses_loss() -> Result<()> {
        let cfg = ModelConfig {
            padding_loss_mixture_weight: 0.0,
            padding_loss_logit_weight: 0.0,
            ..ModelConfig::tiny()
        };
        let (model, _vm) = model_with(cfg)?;
        let device = Device::Cpu;
        let future = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let padding = Tensor::ones((2, 5), DType::F32, &device)?;
        let targets = DecoderTargets { future: &future, padding: Some(&padding), record_weights: None };
        let dl = DecoderLoop::new(&model, false)?;
        let state = dl.init(model.cells().zero_state(2, &device)?, &Tensor::zeros((2, 4), DType::F32, &device)?)?;
        let out = dl.run(state, &targets, &mut StdRng::seed_from_u64(2))?;
        let total = out.losses.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(total, 0.0);
        Ok(())
    }

    /// Summed decoder loss over a batch of two tracks whose future is all padding.
    fn padded_loss(cfg: ModelConfig, record_weights: Option<&Tensor>) -> Result<f32> {
        let (model, _vm) = model_with(cfg)?;
        let device = Device::Cpu;
        let future = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let padding = Tensor::ones((2, 5), DType::F32, &device)?;
        let targets = DecoderTargets { future: &future, padding: Some(&padding), record_weights };
        let dl = DecoderLoop::new(&model, false)?;
        let state = dl.init(model.cells().zero_state(2, &device)?, &Tensor::zeros((2, 4), DType::F32, &device)?)?;
        let out = dl.run(state, &targets, &mut StdRng::seed_from_u64(3))?;
        Ok(out.losses.abs()?.sum_all()?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_padding_head_adds_cross_entropy() -> Result<()> {
        let cfg = ModelConfig {
            track_padding: true,
            padding_loss_mixture_weight: 0.0,
            padding_loss_logit_weight: 1.0,
            ..ModelConfig::tiny()
        };
        let total = padded_loss(cfg.clone(), None)?;
        assert!(total.is_finite() && total > 0.0, "total={total}");

        let silenced = ModelConfig {
            padding_loss_logit_weight: 0.0,
            ..cfg
        };
        assert_eq!(padded_loss(silenced, None)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_filler_rows_carry_no_loss() -> Result<()> {
        let cfg = ModelConfig {
            track_padding: true,
            padding_loss_logit_weight: 1.0,
            ..ModelConfig::tiny()
        };
        let fillers = Tensor::zeros(2, DType::F32, &Device::Cpu)?;
        assert_eq!(padded_loss(cfg, Some(&fillers))?, 0.0);
        Ok(())
    }

    #[test]
    fn test_padding_cross_entropy_prefers_correct_label() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[4.0f32, -4.0], [4.0, -4.0]], &device)?;
        let labels = Tensor::new(&[0.0f32, 1.0], &device)?;
        let ce = padding_cross_entropy(&logits, &labels)?.to_vec1::<f32>()?;
        assert!(ce[0] < 0.01 && ce[1] > 7.0, "ce={ce:?}");
        Ok(())
    }
}
