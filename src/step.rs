use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{LossMode, ModelConfig};
use crate::metrics::MetricSink;
use crate::model::{ModelBatch, Seq2SeqMdn};
use crate::training::{clip_grad_norm, DecayScheduler};

/// Scalars for every step; tensors only in inference.
#[derive(Debug)]
pub struct StepOutput {
    /// Negated loss, so higher is better.
    pub accuracy: f32,
    pub loss: f32,
    /// (batch, P, input_size) sampled trajectory, real units
    pub sampled: Option<Tensor>,
    /// (batch, P, 2) dominant-component means, real units
    pub mixtures: Option<Tensor>,
    /// (batch, P, 2)
    pub padding_logits: Option<Tensor>,
}

/// Owns the model, its variables and the optimizer. One call = one batch.
pub struct StepDriver {
    model: Seq2SeqMdn,
    varmap: VarMap,
    optimizer: AdamW,
    scheduler: DecayScheduler,
    loss_mode: LossMode,
    max_grad_norm: f64,
    global_step: usize,
    rng: StdRng,
}

impl StepDriver {
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let model = Seq2SeqMdn::new(config, &varmap, device)?;
        Self::from_model(model, varmap)
    }

    pub fn from_model(model: Seq2SeqMdn, varmap: VarMap) -> Result<Self> {
        let cfg = &model.config;
        let params = ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self {
            scheduler: DecayScheduler::new(
                cfg.learning_rate,
                cfg.learning_rate_min,
                cfg.learning_rate_decay_factor,
            ),
            loss_mode: cfg.loss_mode,
            max_grad_norm: cfg.max_gradient_norm,
            rng: StdRng::seed_from_u64(cfg.seed),
            global_step: 0,
            model,
            varmap,
            optimizer,
        })
    }

    pub fn model(&self) -> &Seq2SeqMdn {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Seq2SeqMdn {
        &mut self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        self.model.device()
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Resynchronise the step counter after restoring a checkpoint.
    pub fn set_global_step(&mut self, step: usize) {
        self.global_step = step;
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Apply the exponential decay for the current global step.
    pub fn decay_learning_rate(&mut self) -> f64 {
        let lr = self.scheduler.lr_at(self.global_step);
        self.optimizer.set_learning_rate(lr);
        lr
    }

    pub fn step(&mut self, batch: &ModelBatch, train: bool, sink: Option<&dyn MetricSink>) -> Result<StepOutput> {
        let out = self.model.forward(batch, train, &mut self.rng)?;
        let (b, p) = out.losses.dims2()?;
        let full = (out.losses.sum_all()? / (b * p) as f64)?;
        let first = (out.losses.narrow(1, 0, 1)?.sum_all()? / b as f64)?;
        let loss = match self.loss_mode {
            LossMode::FirstStep => first,
            LossMode::FullHorizon => full,
        };
        let loss_value = loss.to_scalar::<f32>()?;

        if !train {
            return Ok(StepOutput {
                accuracy: -loss_value,
                loss: loss_value,
                sampled: Some(out.sampled),
                mixtures: Some(out.mixtures),
                padding_logits: Some(out.padding_logits),
            });
        }

        let mut grads = loss.backward()?;
        let vars = self.varmap.all_vars();
        let grad_norm = clip_grad_norm(&mut grads, &vars, self.max_grad_norm)?;
        self.optimizer.step(&grads)?;
        self.global_step += 1;

        tracing::debug!(step = self.global_step, loss = loss_value, grad_norm, "train step");
        if let Some(sink) = sink {
            self.emit(sink, loss_value, grad_norm)?;
        }

        Ok(StepOutput {
            accuracy: -loss_value,
            loss: loss_value,
            sampled: None,
            mixtures: None,
            padding_logits: None,
        })
    }

    fn emit(&self, sink: &dyn MetricSink, loss: f32, grad_norm: f64) -> Result<()> {
        let step = self.global_step;
        let tag = match self.loss_mode {
            LossMode::FirstStep => "Training_Loss_First",
            LossMode::FullHorizon => "Training_Loss",
        };
        sink.scalar(tag, step, loss as f64);
        sink.scalar("Learning_Rate", step, self.learning_rate());
        sink.scalar("Gradient_Norm", step, grad_norm);
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("varmap lock poisoned"))?;
        for (name, var) in data.iter() {
            let values = var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
            sink.histogram(name, step, &values);
        }
        Ok(())
    }
}
