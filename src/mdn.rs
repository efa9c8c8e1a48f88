// Bivariate Gaussian mixture output head.
//
// Parameter layout per row is block-major over `m` components:
//   [pi_logit x m | mu1 x m | mu2 x m | log_sigma1 x m | log_sigma2 x m | rho_raw x m]
// Everything here works in normalised (model) units unless a Scaling is passed.

use anyhow::{ensure, Result};
use candle_core::{Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::InputColumn;
use crate::scaling::Scaling;

/// Keeps |rho| strictly inside 1 so the covariance stays positive-definite.
pub const RHO_LIMIT: f64 = 1.0 - 1e-5;
/// log-sigma is clamped to +-this before exponentiation.
pub const LOG_SIGMA_LIMIT: f64 = 10.0;
/// Below this temperature sampling is the arg-max component's mean.
const GREEDY_TEMPERATURE: f64 = 1e-6;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

// ---------------------------------------------------------------------------
// Host-side mixture (one row)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Mixture {
    /// Raw component logits, pre-softmax.
    pub pi_logits: Vec<f32>,
    pub mu1: Vec<f32>,
    pub mu2: Vec<f32>,
    pub sigma1: Vec<f32>,
    pub sigma2: Vec<f32>,
    pub rho: Vec<f32>,
}

impl Mixture {
    pub fn from_raw(raw: &[f32], num_mixtures: usize) -> Result<Self> {
        let m = num_mixtures;
        ensure!(
            m > 0 && raw.len() == 6 * m,
            "mixture row has {} values, expected 6*{m}",
            raw.len()
        );
        let block = |k: usize| raw[k * m..(k + 1) * m].to_vec();
        let sigma = |k: usize| {
            raw[k * m..(k + 1) * m]
                .iter()
                .map(|&s| (s as f64).clamp(-LOG_SIGMA_LIMIT, LOG_SIGMA_LIMIT).exp() as f32)
                .collect()
        };
        Ok(Self {
            pi_logits: block(0),
            mu1: block(1),
            mu2: block(2),
            sigma1: sigma(3),
            sigma2: sigma(4),
            rho: raw[5 * m..]
                .iter()
                .map(|&r| ((r as f64).tanh() * RHO_LIMIT) as f32)
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.pi_logits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pi_logits.is_empty()
    }

    /// Component weights after temperature-scaled softmax.
    pub fn weights(&self, temperature: f64) -> Vec<f64> {
        let t = temperature.max(GREEDY_TEMPERATURE);
        let max = self
            .pi_logits
            .iter()
            .cloned()
            .fold(f32::NEG_INFINITY, f32::max) as f64;
        let exps: Vec<f64> = self
            .pi_logits
            .iter()
            .map(|&l| ((l as f64 - max) / t).exp())
            .collect();
        let sum: f64 = exps.iter().sum();
        exps.iter().map(|e| e / sum).collect()
    }

    /// Index of the highest-weight component.
    pub fn dominant(&self) -> usize {
        self.pi_logits
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &l)| {
                if l > best.1 { (i, l) } else { best }
            })
            .0
    }

    /// Draw one point. Temperature flattens component choice and widens each Gaussian.
    pub fn sample<R: Rng + ?Sized>(&self, temperature: f64, rng: &mut R) -> [f32; 2] {
        if temperature < GREEDY_TEMPERATURE {
            let k = self.dominant();
            return [self.mu1[k], self.mu2[k]];
        }
        let weights = self.weights(temperature);
        let k = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.dominant(),
        };
        let scale = temperature.sqrt();
        let s1 = self.sigma1[k] as f64 * scale;
        let s2 = self.sigma2[k] as f64 * scale;
        let rho = self.rho[k] as f64;
        let z1: f64 = StandardNormal.sample(rng);
        let z2: f64 = StandardNormal.sample(rng);
        let x = self.mu1[k] as f64 + s1 * z1;
        let y = self.mu2[k] as f64 + s2 * (rho * z1 + (1.0 - rho * rho).sqrt() * z2);
        [x as f32, y as f32]
    }

    /// Log-density of `target` under the full mixture, via log-sum-exp.
    pub fn log_likelihood(&self, target: [f32; 2]) -> f64 {
        let weights = self.weights(1.0);
        let terms: Vec<f64> = (0..self.len())
            .map(|k| {
                let s1 = self.sigma1[k] as f64;
                let s2 = self.sigma2[k] as f64;
                let rho = self.rho[k] as f64;
                let n1 = (target[0] as f64 - self.mu1[k] as f64) / s1;
                let n2 = (target[1] as f64 - self.mu2[k] as f64) / s2;
                let one_minus = 1.0 - rho * rho;
                let z = n1 * n1 + n2 * n2 - 2.0 * rho * n1 * n2;
                weights[k].max(f64::MIN_POSITIVE).ln() - z / (2.0 * one_minus)
                    - LN_2PI
                    - s1.ln()
                    - s2.ln()
                    - 0.5 * one_minus.ln()
            })
            .collect();
        let max = terms.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln()
    }
}

/// Best-estimate point for reporting: dominant component mean, in real-world units.
pub fn resolve_and_upscale(raw: &[f32], num_mixtures: usize, scaling: &Scaling) -> Result<[f32; 2]> {
    let mix = Mixture::from_raw(raw, num_mixtures)?;
    let k = mix.dominant();
    Ok(scaling.upscale_point([mix.mu1[k], mix.mu2[k]]))
}

pub fn sample_batch<R: Rng + ?Sized>(
    params: &Tensor,
    num_mixtures: usize,
    temperature: f64,
    rng: &mut R,
) -> Result<Vec<[f32; 2]>> {
    params
        .to_vec2::<f32>()?
        .iter()
        .map(|row| Ok(Mixture::from_raw(row, num_mixtures)?.sample(temperature, rng)))
        .collect()
}

pub fn resolve_batch(params: &Tensor, num_mixtures: usize, scaling: &Scaling) -> Result<Vec<[f32; 2]>> {
    params
        .to_vec2::<f32>()?
        .iter()
        .map(|row| resolve_and_upscale(row, num_mixtures, scaling))
        .collect()
}

// ---------------------------------------------------------------------------
// Differentiable loss
// ---------------------------------------------------------------------------

/// Negative log-likelihood of `target` (batch, >=2; first two columns used)
/// under the mixture `params` (batch, 6m). Returns (batch,).
///
/// Built from basic ops only so autograd is exact; log-sum-exp keeps log(0) out.
pub fn mixture_nll(target: &Tensor, params: &Tensor, num_mixtures: usize) -> Result<Tensor> {
    let m = num_mixtures;
    let (_, width) = params.dims2()?;
    ensure!(width == 6 * m, "mixture width {width} != 6*{m}");

    let pi_logits = params.narrow(1, 0, m)?;
    let mu1 = params.narrow(1, m, m)?;
    let mu2 = params.narrow(1, 2 * m, m)?;
    let log_s1 = params
        .narrow(1, 3 * m, m)?
        .clamp(-LOG_SIGMA_LIMIT, LOG_SIGMA_LIMIT)?;
    let log_s2 = params
        .narrow(1, 4 * m, m)?
        .clamp(-LOG_SIGMA_LIMIT, LOG_SIGMA_LIMIT)?;
    let rho = (params.narrow(1, 5 * m, m)?.tanh()? * RHO_LIMIT)?;

    let x1 = target.narrow(1, 0, 1)?;
    let x2 = target.narrow(1, 1, 1)?;
    let n1 = x1.broadcast_sub(&mu1)?.div(&log_s1.exp()?)?;
    let n2 = x2.broadcast_sub(&mu2)?.div(&log_s2.exp()?)?;

    let one_minus = (rho.sqr()?.neg()? + 1.0)?;
    let cross = ((&rho * &n1)?.mul(&n2)? * 2.0)?;
    let z = ((n1.sqr()? + n2.sqr()?)? - cross)?;
    let log_norm = ((z.div(&(&one_minus * 2.0)?)?.neg()? - LN_2PI)? - (&log_s1 + &log_s2)?)?;
    let log_norm = (log_norm - (one_minus.log()? * 0.5)?)?;

    let log_pi = grad_log_softmax_last_dim(&pi_logits)?;
    let joint = (log_pi + log_norm)?;
    let max = joint.max_keepdim(D::Minus1)?;
    let lse = (joint
        .broadcast_sub(&max)?
        .exp()?
        .sum_keepdim(D::Minus1)?
        .log()?
        + max)?;
    lse.squeeze(D::Minus1)?.neg().map_err(Into::into)
}

fn grad_log_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let lse = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    shifted.broadcast_sub(&lse).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Derivative reconstruction
// ---------------------------------------------------------------------------

/// Rebuild a full input row from the previous input row and a new position.
///
/// Velocities are the finite difference divided by `subsample_rate`. Below
/// `velocity_threshold` the object is treated as stationary: velocity and
/// speed are zeroed and heading is carried over from `previous`.
pub fn compute_derivative(
    previous: &[f32],
    sampled: [f32; 2],
    layout: &[InputColumn],
    velocity_threshold: f32,
    subsample_rate: usize,
) -> Vec<f32> {
    let dt = subsample_rate.max(1) as f32;
    let mut vx = (sampled[0] - previous[0]) / dt;
    let mut vy = (sampled[1] - previous[1]) / dt;
    let mut speed = vx.hypot(vy);
    let moving = speed.is_finite() && speed >= velocity_threshold;
    if !moving {
        vx = 0.0;
        vy = 0.0;
        speed = 0.0;
    }
    layout
        .iter()
        .enumerate()
        .map(|(i, col)| match col {
            InputColumn::PosX => sampled[0],
            InputColumn::PosY => sampled[1],
            InputColumn::VelX => vx,
            InputColumn::VelY => vy,
            InputColumn::Speed => speed,
            InputColumn::Heading if moving => vy.atan2(vx),
            InputColumn::Heading => previous.get(i).copied().unwrap_or(0.0),
            InputColumn::Other => 0.0,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_component_row() -> Vec<f32> {
        // pi, mu1, mu2, log_s1, log_s2, rho
        vec![
            0.0, 2.0, // pi logits: component 1 dominant
            -1.0, 3.0, // mu1
            -1.0, 4.0, // mu2
            0.0, -1.0, // log sigma1
            0.0, -1.0, // log sigma2
            0.0, 0.5, // rho raw
        ]
    }

    #[test]
    fn test_zero_temperature_is_dominant_mean() -> Result<()> {
        let mix = Mixture::from_raw(&two_component_row(), 2)?;
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(mix.sample(0.0, &mut rng), [3.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_sampling_deterministic_for_seed() -> Result<()> {
        let mix = Mixture::from_raw(&two_component_row(), 2)?;
        let a: Vec<[f32; 2]> = {
            let mut rng = StdRng::seed_from_u64(3);
            (0..10).map(|_| mix.sample(1.0, &mut rng)).collect()
        };
        let b: Vec<[f32; 2]> = {
            let mut rng = StdRng::seed_from_u64(3);
            (0..10).map(|_| mix.sample(1.0, &mut rng)).collect()
        };
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_temperature_flattens_weights() -> Result<()> {
        let mix = Mixture::from_raw(&two_component_row(), 2)?;
        let cold = mix.weights(0.5);
        let hot = mix.weights(4.0);
        assert!(hot[0] > cold[0], "hot={hot:?} cold={cold:?}");
        Ok(())
    }

    #[test]
    fn test_sampled_points_have_finite_loss() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let raw: Vec<f32> = (0..18).map(|_| rng.gen_range(-3.0f32..3.0)).collect();
            let mix = Mixture::from_raw(&raw, 3)?;
            let p = mix.sample(1.0, &mut rng);
            let nll = -mix.log_likelihood(p);
            assert!(nll.is_finite(), "nll not finite for {raw:?}");
        }
        Ok(())
    }

    #[test]
    fn test_tensor_loss_matches_host() -> Result<()> {
        let device = Device::Cpu;
        let row = two_component_row();
        let params = Tensor::from_vec(row.clone(), (1, 12), &device)?;
        let target = Tensor::new(&[[2.5f32, 3.5]], &device)?;
        let nll = mixture_nll(&target, &params, 2)?.to_vec1::<f32>()?;
        let host = -Mixture::from_raw(&row, 2)?.log_likelihood([2.5, 3.5]);
        assert!(
            (nll[0] as f64 - host).abs() < 1e-4,
            "tensor={} host={host}",
            nll[0]
        );
        Ok(())
    }

    #[test]
    fn test_loss_prefers_near_targets() -> Result<()> {
        let device = Device::Cpu;
        let params = Tensor::from_vec(two_component_row(), (1, 12), &device)?;
        let near = mixture_nll(&Tensor::new(&[[3.0f32, 4.0]], &device)?, &params, 2)?;
        let far = mixture_nll(&Tensor::new(&[[30.0f32, -40.0]], &device)?, &params, 2)?;
        let (near, far) = (near.to_vec1::<f32>()?[0], far.to_vec1::<f32>()?[0]);
        assert!(near < far, "near={near} far={far}");
        assert!(far.is_finite());
        Ok(())
    }

    #[test]
    fn test_loss_has_gradients() -> Result<()> {
        let device = Device::Cpu;
        let var = candle_core::Var::from_tensor(&Tensor::from_vec(
            two_component_row(),
            (1, 12),
            &device,
        )?)?;
        let target = Tensor::new(&[[0.0f32, 0.0]], &device)?;
        let loss = mixture_nll(&target, var.as_tensor(), 2)?.sum_all()?;
        let grads = loss.backward()?;
        let g = grads.get(var.as_tensor()).expect("gradient for params");
        let max = g.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max.is_finite() && max > 0.0, "grad max={max}");
        Ok(())
    }

    #[test]
    fn test_resolve_and_upscale_round_trip() -> Result<()> {
        let mut scaling = Scaling::identity(4);
        scaling.set(vec![10.0, -5.0, 0.0, 0.0], vec![2.0, 3.0, 1.0, 1.0])?;
        let real = resolve_and_upscale(&two_component_row(), 2, &scaling)?;
        assert_eq!(real, [16.0, 7.0]);
        let back = scaling.downscale_point(real);
        assert!((back[0] - 3.0).abs() < 1e-6 && (back[1] - 4.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_compute_derivative_velocity_and_subsample() {
        let layout = [
            InputColumn::PosX,
            InputColumn::PosY,
            InputColumn::VelX,
            InputColumn::VelY,
            InputColumn::Speed,
        ];
        let prev = [0.0f32, 0.0, 0.0, 0.0, 0.0];
        let row = compute_derivative(&prev, [6.0, 8.0], &layout, 0.1, 2);
        assert_eq!(row, vec![6.0, 8.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_compute_derivative_stationary_holds_heading() {
        let layout = [InputColumn::PosX, InputColumn::PosY, InputColumn::Heading, InputColumn::Other];
        let prev = [1.0f32, 1.0, 0.75, 9.0];
        let row = compute_derivative(&prev, [1.01, 1.0], &layout, 0.5, 1);
        assert_eq!(row, vec![1.01, 1.0, 0.75, 0.0]);

        let moving = compute_derivative(&prev, [1.0, 3.0], &layout, 0.5, 1);
        assert!((moving[2] - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
    }
}
