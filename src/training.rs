use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Var;
use std::time::Instant;

use crate::batch::{BatchSource, ClassPrototypes};
use crate::checkpoint::CheckpointManager;
use crate::evaluator::run_validation;
use crate::metrics::MetricSink;
use crate::report::trajectory_svg;
use crate::step::StepDriver;

// ---------------------------------------------------------------------------
// Exponential LR decay with a floor
// ---------------------------------------------------------------------------

/// lr(step) = (base - min) * decay^step + min
pub struct DecayScheduler {
    base_lr: f64,
    min_lr: f64,
    decay: f64,
    current_step: usize,
}

impl DecayScheduler {
    pub fn new(base_lr: f64, min_lr: f64, decay: f64) -> Self {
        Self {
            base_lr,
            min_lr,
            decay,
            current_step: 0,
        }
    }

    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }

    pub fn get_lr(&self) -> f64 {
        self.lr_at(self.current_step)
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        let exponent = step.min(i32::MAX as usize) as i32;
        (self.base_lr - self.min_lr) * self.decay.powi(exponent) + self.min_lr
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

// ---------------------------------------------------------------------------
// Global-norm gradient clipping
// ---------------------------------------------------------------------------

/// Rescales every gradient in place so their joint L2 norm is at most
/// `max_norm`. Returns the norm before clipping. `max_norm <= 0` disables.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sum_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = sum_sq.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            let clipped = match grads.get(var.as_tensor()) {
                Some(g) => (g * scale)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(norm)
}

// ---------------------------------------------------------------------------
// Early Stopping + Best Step Tracking
// ---------------------------------------------------------------------------

/// Tracks the best validation loss. Call `check()` after every validation.
pub struct EarlyStopping {
    threshold: Option<f32>,
    patience: usize,
    below_count: usize,
    stale_count: usize,
    stale_stop: bool,
    best: Option<(usize, f32)>,
}

#[derive(Debug, PartialEq)]
pub enum EarlyStopAction {
    Continue,
    NewBest,
    Stop,
}

impl EarlyStopping {
    /// `threshold`: stop once the loss stays below it for `patience` checks.
    /// `None` disables threshold stopping; the best step is still tracked.
    pub fn new(threshold: Option<f32>, patience: usize) -> Self {
        Self {
            threshold,
            patience,
            below_count: 0,
            stale_count: 0,
            stale_stop: false,
            best: None,
        }
    }

    /// Also stop when the best loss has not improved for `patience` checks.
    pub fn with_stale_stop(mut self) -> Self {
        self.stale_stop = true;
        self
    }

    pub fn check(&mut self, loss: f32, step: usize) -> EarlyStopAction {
        let mut action = EarlyStopAction::Continue;

        if self.best.map_or(true, |(_, best)| loss < best) {
            self.best = Some((step, loss));
            tracing::info!(step, loss, "new best validation loss");
            action = EarlyStopAction::NewBest;
        }

        if let Some(threshold) = self.threshold {
            if loss < threshold {
                self.below_count += 1;
                if self.below_count >= self.patience {
                    tracing::info!(step, loss, threshold, patience = self.patience, "early stop: below threshold");
                    return EarlyStopAction::Stop;
                }
            } else {
                self.below_count = 0;
            }
        }

        if self.stale_stop {
            if action == EarlyStopAction::NewBest {
                self.stale_count = 0;
            } else {
                self.stale_count += 1;
                if self.stale_count >= self.patience {
                    tracing::info!(step, patience = self.patience, best = ?self.best, "early stop: no improvement");
                    return EarlyStopAction::Stop;
                }
            }
        }

        action
    }

    /// (step, loss) of the best check so far.
    pub fn best(&self) -> Option<(usize, f32)> {
        self.best
    }
}

// ---------------------------------------------------------------------------
// Training loop
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub max_steps: usize,
    /// Validate (and maybe checkpoint) every this many steps. 0 disables.
    pub validate_every: usize,
    /// Apply LR decay every this many steps. 0 disables.
    pub decay_every: usize,
    pub log_every: usize,
    pub patience: usize,
    pub stop_threshold: Option<f32>,
    /// Validate on one random batch instead of a full pass.
    pub quick_validation: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_steps: 2000,
            validate_every: 100,
            decay_every: 100,
            log_every: 20,
            patience: 5,
            stop_threshold: None,
            quick_validation: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub steps: usize,
    pub best: Option<(usize, f32)>,
    pub stopped_early: bool,
    pub final_train_loss: f32,
    pub elapsed_secs: f64,
}

/// Random-minibatch training with periodic validation. With a checkpoint
/// manager, every new best is saved, the best step is restored at the end
/// and all other checkpoints are deleted.
pub fn train<S, V>(
    driver: &mut StepDriver,
    train_source: &mut S,
    val_source: &mut V,
    prototypes: &ClassPrototypes,
    cfg: &TrainingConfig,
    mut checkpoints: Option<&mut CheckpointManager>,
    sink: Option<&dyn MetricSink>,
) -> Result<TrainingSummary>
where
    S: BatchSource + ?Sized,
    V: BatchSource + ?Sized,
{
    let start = Instant::now();
    let device = driver.device().clone();
    let mut early = EarlyStopping::new(cfg.stop_threshold, cfg.patience).with_stale_stop();
    let mut final_train_loss = f32::NAN;
    let mut stopped_early = false;
    let mut steps_run = 0usize;

    tracing::info!(max_steps = cfg.max_steps, from = driver.global_step(), "training");
    for _ in 0..cfg.max_steps {
        steps_run += 1;
        let minibatch = train_source.get_random_minibatch()?;
        let batch = train_source.format_minibatch_data(&minibatch, &device)?;
        final_train_loss = driver.step(&batch, true, sink)?.loss;
        let step = driver.global_step();

        if cfg.decay_every > 0 && step % cfg.decay_every == 0 {
            driver.decay_learning_rate();
        }
        if cfg.log_every > 0 && step % cfg.log_every == 0 {
            tracing::info!(step, loss = final_train_loss, lr = driver.learning_rate(), "train");
        }
        if cfg.validate_every == 0 || step % cfg.validate_every != 0 {
            continue;
        }

        let val = run_validation(driver, val_source, prototypes, cfg.quick_validation)?;
        tracing::info!(step, loss = val.loss, accuracy = val.class_accuracy, records = val.records, "validation");
        if let Some(sink) = sink {
            sink.scalar("Validation_Loss", step, val.loss as f64);
            sink.scalar("Validation_Accuracy", step, val.class_accuracy);
            if let Some(example) = &val.example {
                sink.image("Validation_Trajectory", step, trajectory_svg(example).as_bytes());
            }
        }
        match early.check(val.loss, step) {
            EarlyStopAction::NewBest => {
                if let Some(ckpt) = checkpoints.as_deref_mut() {
                    ckpt.save(driver.varmap(), driver.model().scaling(), step)?;
                }
            }
            EarlyStopAction::Stop => {
                stopped_early = true;
                break;
            }
            EarlyStopAction::Continue => {}
        }
    }

    if let (Some(ckpt), Some((best_step, best_loss))) = (checkpoints, early.best()) {
        let mut scaling = driver.model().scaling().clone();
        if ckpt.restore(driver.varmap(), &mut scaling, Some(best_step), &device)?.is_some() {
            driver.model_mut().set_scaling(scaling)?;
            driver.set_global_step(best_step);
            ckpt.clean(Some(best_step))?;
            tracing::info!(best_step, best_loss, "restored best checkpoint");
        }
    }

    let elapsed_secs = start.elapsed().as_secs_f64();
    let steps = steps_run;
    tracing::info!(
        elapsed_secs,
        steps,
        steps_per_sec = steps as f64 / elapsed_secs.max(0.001),
        "training done"
    );
    Ok(TrainingSummary {
        steps,
        best: early.best(),
        stopped_early,
        final_train_loss,
        elapsed_secs,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarMap;

    #[test]
    fn test_decay_schedule_values() {
        let mut sched = DecayScheduler::new(1e-3, 1e-5, 0.5);
        assert!((sched.get_lr() - 1e-3).abs() < 1e-12);
        let lr1 = sched.step();
        assert!((lr1 - ((1e-3 - 1e-5) * 0.5 + 1e-5)).abs() < 1e-12, "lr1={lr1}");
        assert_eq!(sched.current_step(), 1);
    }

    #[test]
    fn test_decay_schedule_bounds() {
        let sched = DecayScheduler::new(1e-3, 1e-5, 0.9);
        let mut prev = f64::INFINITY;
        for step in 0..500 {
            let lr = sched.lr_at(step);
            assert!(lr >= 1e-5 - 1e-12, "LR below min: {lr}");
            assert!(lr <= prev, "LR increased at step {step}");
            prev = lr;
        }
    }

    #[test]
    fn test_clip_grad_norm_scales_to_max() -> Result<()> {
        let varmap = VarMap::new();
        let w = varmap.get((2,), "w", candle_nn::Init::Const(0.0), DType::F32, &Device::Cpu)?;
        let target = Tensor::new(&[3.0f32, 4.0], &Device::Cpu)?;
        // d/dw of sum(w * target) is target, norm 5
        let loss = (w * target)?.sum_all()?;
        let mut grads = loss.backward()?;
        let vars = varmap.all_vars();
        let norm = clip_grad_norm(&mut grads, &vars, 1.0)?;
        assert!((norm - 5.0).abs() < 1e-5, "norm={norm}");
        let g = grads
            .get(vars[0].as_tensor())
            .ok_or_else(|| anyhow::anyhow!("missing grad"))?
            .to_vec1::<f32>()?;
        let clipped = (g[0] * g[0] + g[1] * g[1]).sqrt();
        assert!((clipped - 1.0).abs() < 1e-4, "clipped={clipped}");
        Ok(())
    }

    #[test]
    fn test_clip_grad_norm_leaves_small_gradients() -> Result<()> {
        let varmap = VarMap::new();
        let w = varmap.get((2,), "w", candle_nn::Init::Const(0.0), DType::F32, &Device::Cpu)?;
        let loss = (w * Tensor::new(&[0.3f32, 0.4], &Device::Cpu)?)?.sum_all()?;
        let mut grads = loss.backward()?;
        let vars = varmap.all_vars();
        clip_grad_norm(&mut grads, &vars, 1.0)?;
        let g = grads
            .get(vars[0].as_tensor())
            .ok_or_else(|| anyhow::anyhow!("missing grad"))?
            .to_vec1::<f32>()?;
        assert_eq!(g, vec![0.3, 0.4]);
        Ok(())
    }

    #[test]
    fn test_early_stopping_threshold() {
        let mut es = EarlyStopping::new(Some(0.01), 3);
        assert_eq!(es.check(0.5, 1), EarlyStopAction::NewBest);
        assert_eq!(es.check(0.3, 2), EarlyStopAction::NewBest);
        assert_eq!(es.check(0.005, 3), EarlyStopAction::NewBest);
        assert_eq!(es.check(0.004, 4), EarlyStopAction::NewBest);
        assert_eq!(es.check(0.003, 5), EarlyStopAction::Stop);
    }

    #[test]
    fn test_early_stopping_reset_on_spike() {
        let mut es = EarlyStopping::new(Some(0.01), 3);
        es.check(0.005, 1);
        es.check(0.004, 2);
        es.check(0.05, 3);
        assert_ne!(es.check(0.003, 4), EarlyStopAction::Stop);
    }

    #[test]
    fn test_early_stopping_negative_losses() {
        // mixture NLL can go below zero
        let mut es = EarlyStopping::new(None, 3);
        assert_eq!(es.check(-1.0, 1), EarlyStopAction::NewBest);
        assert_eq!(es.check(-2.0, 2), EarlyStopAction::NewBest);
        for step in 3..50 {
            assert_ne!(es.check(-1.5, step), EarlyStopAction::Stop);
        }
        assert_eq!(es.best(), Some((2, -2.0)));
    }

    #[test]
    fn test_early_stopping_stale_stop() {
        let mut es = EarlyStopping::new(None, 3).with_stale_stop();
        assert_eq!(es.check(1.0, 1), EarlyStopAction::NewBest);
        assert_eq!(es.check(0.9, 2), EarlyStopAction::NewBest);
        assert_eq!(es.check(1.0, 3), EarlyStopAction::Continue);
        assert_eq!(es.check(1.1, 4), EarlyStopAction::Continue);
        assert_eq!(es.check(1.2, 5), EarlyStopAction::Stop);
        assert_eq!(es.best(), Some((2, 0.9)));
    }
}
