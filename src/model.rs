use anyhow::{ensure, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Dropout, Init, Linear, VarBuilder, VarMap};
use rand::Rng;

use crate::cell::{CellStack, CellState};
use crate::config::ModelConfig;
use crate::decoder::{DecoderLoop, DecoderOutput, DecoderTargets};
use crate::error::ConfigError;
use crate::scaling::Scaling;

/// Bias of every projection layer at init.
const PROJECTION_BIAS: f64 = 0.1;

/// One minibatch in tensor form, all positions in real-world units.
#[derive(Debug, Clone)]
pub struct ModelBatch {
    /// (batch, observation_steps, input_size)
    pub observations: Tensor,
    /// (batch, prediction_steps, input_size)
    pub future: Tensor,
    /// (batch, prediction_steps), 1.0 where the step is padding
    pub padding: Tensor,
    /// (batch,), 0.0 for filler records that only square up the batch
    pub record_weights: Tensor,
}

impl ModelBatch {
    pub fn batch_size(&self) -> usize {
        self.observations.dims().first().copied().unwrap_or(0)
    }
}

/// Normal(0, stdev) weights with a constant bias.
fn projection(in_dim: usize, out_dim: usize, stdev: f64, vb: VarBuilder) -> Result<Linear> {
    let w = vb.get_with_hints((out_dim, in_dim), "weight", Init::Randn { mean: 0.0, stdev })?;
    let b = vb.get_with_hints(out_dim, "bias", Init::Const(PROJECTION_BIAS))?;
    Ok(Linear::new(w, Some(b)))
}

// ---------------------------------------------------------------------------
// Seq2SeqMdn
// ---------------------------------------------------------------------------

/// Encoder/decoder recurrent network with a bivariate Gaussian mixture head.
///
/// The encoder and decoder share one [`CellStack`]; the decoder's state is
/// seeded with the encoder's final state.
pub struct Seq2SeqMdn {
    pub config: ModelConfig,
    input_layer: Linear,
    embed_dropout: Dropout,
    cells: CellStack,
    mdn_proj: Linear,
    pad_proj: Option<Linear>,
    scaling: Scaling,
    device: Device,
}

impl Seq2SeqMdn {
    pub fn new(config: ModelConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        config.validate()?;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let stdev = 1.0 / (config.embedding_size as f64).sqrt();

        let input_layer = projection(config.input_size, config.embedding_size, stdev, vb.pp("input_layer"))?;
        let cells = CellStack::new(
            config.cell,
            config.embedding_size,
            config.rnn_size,
            config.num_layers,
            config.dropout_prob,
            vb.pp("rnn"),
        )?;
        let mdn_proj = projection(config.rnn_size, config.mdn_width(), stdev, vb.pp("mdn_output"))?;
        let pad_proj = if config.track_padding {
            Some(projection(config.rnn_size, 2, stdev, vb.pp("padding_output"))?)
        } else {
            None
        };

        tracing::info!(
            cell = ?config.cell,
            layers = config.num_layers,
            rnn = config.rnn_size,
            mixtures = config.num_mixtures,
            feedback = config.feedback.name(),
            "built seq2seq MDN"
        );

        Ok(Self {
            embed_dropout: Dropout::new(config.embedding_dropout as f32),
            scaling: Scaling::identity(config.input_size),
            device: device.clone(),
            config,
            input_layer,
            cells,
            mdn_proj,
            pad_proj,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn scaling(&self) -> &Scaling {
        &self.scaling
    }

    /// Fix the per-feature scaling for the rest of the run.
    pub fn set_normalization(&mut self, mean: Vec<f32>, stddev: Vec<f32>) -> Result<(), ConfigError> {
        self.scaling.set(mean, stddev)
    }

    pub fn set_scaling(&mut self, scaling: Scaling) -> Result<(), ConfigError> {
        self.scaling.set(scaling.mean().to_vec(), scaling.stddev().to_vec())
    }

    /// Fatal configuration checks that depend on runtime state, run before any loop.
    pub fn check_ready(&self) -> Result<(), ConfigError> {
        if self.config.feedback.needs_scaling() && !self.scaling.is_initialized() {
            return Err(ConfigError::ScalingNotInitialized {
                policy: self.config.feedback.name(),
            });
        }
        Ok(())
    }

    pub fn cells(&self) -> &CellStack {
        &self.cells
    }

    pub fn mdn_projection(&self) -> &Linear {
        &self.mdn_proj
    }

    pub fn padding_projection(&self) -> Option<&Linear> {
        self.pad_proj.as_ref()
    }

    /// Normalise then embed a (batch, input_size) row of real-unit features.
    pub fn embed(&self, raw: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.scaling.normalize(raw)?;
        let x = self.input_layer.forward(&x)?.relu()?;
        Ok(self.embed_dropout.forward(&x, train)?)
    }

    /// Runs the shared stack over every observation except the last.
    pub fn encode(&self, observations: &Tensor, train: bool) -> Result<CellState> {
        let (batch, steps, _) = observations.dims3()?;
        let mut state = self.cells.zero_state(batch, &self.device)?;
        for t in 0..steps.saturating_sub(1) {
            let x = self.embed(&observations.i((.., t, ..))?.contiguous()?, train)?;
            let (_, next) = self.cells.step(&x, &state, train)?;
            state = next;
        }
        Ok(state)
    }

    pub fn forward<R: Rng + ?Sized>(&self, batch: &ModelBatch, train: bool, rng: &mut R) -> Result<DecoderOutput> {
        let decoder = DecoderLoop::new(self, train)?;
        let cfg = &self.config;
        let (b, obs, width) = batch.observations.dims3()?;
        ensure!(
            obs == cfg.observation_steps && width == cfg.input_size,
            "observations are ({b}, {obs}, {width}), model expects (_, {}, {})",
            cfg.observation_steps,
            cfg.input_size
        );
        ensure!(
            batch.future.dims3()? == (b, cfg.prediction_steps, cfg.input_size),
            "future shape {:?} does not match prediction_steps={}",
            batch.future.dims(),
            cfg.prediction_steps
        );

        let encoded = self.encode(&batch.observations, train)?;
        let last = batch.observations.i((.., obs - 1, ..))?.contiguous()?;
        let state = decoder.init(encoded, &last)?;
        let targets = DecoderTargets {
            future: &batch.future,
            padding: Some(&batch.padding),
            record_weights: Some(&batch.record_weights),
        };
        decoder.run(state, &targets, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_batch(cfg: &ModelConfig, batch: usize) -> Result<ModelBatch> {
        let device = Device::Cpu;
        Ok(ModelBatch {
            observations: Tensor::randn(0f32, 1.0, (batch, cfg.observation_steps, cfg.input_size), &device)?,
            future: Tensor::randn(0f32, 1.0, (batch, cfg.prediction_steps, cfg.input_size), &device)?,
            padding: Tensor::zeros((batch, cfg.prediction_steps), DType::F32, &device)?,
            record_weights: Tensor::ones(batch, DType::F32, &device)?,
        })
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let cfg = ModelConfig::tiny();
        let varmap = VarMap::new();
        let mut model = Seq2SeqMdn::new(cfg.clone(), &varmap, &Device::Cpu)?;
        model.set_normalization(vec![0.0; 4], vec![1.0; 4])?;
        let out = model.forward(&random_batch(&cfg, 3)?, false, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(out.sampled.dims3()?, (3, cfg.prediction_steps, cfg.input_size));
        assert_eq!(out.losses.dims2()?, (3, cfg.prediction_steps));
        Ok(())
    }

    #[test]
    fn test_forward_without_scaling_is_config_error() -> Result<()> {
        let cfg = ModelConfig::tiny();
        let varmap = VarMap::new();
        let model = Seq2SeqMdn::new(cfg.clone(), &varmap, &Device::Cpu)?;
        let err = model
            .forward(&random_batch(&cfg, 2)?, false, &mut StdRng::seed_from_u64(0))
            .err()
            .expect("forward should fail");
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::ScalingNotInitialized { policy: "derivative" })
        );
        Ok(())
    }

    #[test]
    fn test_wrong_horizon_rejected() -> Result<()> {
        let cfg = ModelConfig::tiny();
        let varmap = VarMap::new();
        let mut model = Seq2SeqMdn::new(cfg.clone(), &varmap, &Device::Cpu)?;
        model.set_normalization(vec![0.0; 4], vec![1.0; 4])?;
        let other = ModelConfig { prediction_steps: 7, ..cfg };
        assert!(model
            .forward(&random_batch(&other, 2)?, false, &mut StdRng::seed_from_u64(0))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_no_padding_head_when_disabled() -> Result<()> {
        let cfg = ModelConfig { track_padding: false, ..ModelConfig::tiny() };
        let varmap = VarMap::new();
        let model = Seq2SeqMdn::new(cfg, &varmap, &Device::Cpu)?;
        assert!(model.padding_projection().is_none());
        Ok(())
    }
}
