use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear, linear_no_bias, Dropout, Linear, VarBuilder};

use crate::config::CellKind;

// ---------------------------------------------------------------------------
// Gradient-safe activations and LayerNorm (basic ops only)
// ---------------------------------------------------------------------------

fn grad_sigmoid(x: &Tensor) -> Result<Tensor> {
    (x.neg()?.exp()? + 1.0)?.recip().map_err(Into::into)
}

pub struct GradLayerNorm {
    gain: Tensor,
    bias: Tensor,
    eps: f64,
}

impl GradLayerNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let gain = vb.get_with_hints(dim, "gain", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { gain, bias, eps })
    }

    /// Normalises over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.gain)?
            .broadcast_add(&self.bias)
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LayerState {
    pub h: Tensor,
    /// Memory cell; `None` for GRU layers.
    pub c: Option<Tensor>,
}

/// Hidden state of the whole stack, one entry per layer.
#[derive(Debug, Clone)]
pub struct CellState {
    pub layers: Vec<LayerState>,
}

impl CellState {
    /// Output of the top layer.
    pub fn top(&self) -> Option<&Tensor> {
        self.layers.last().map(|l| &l.h)
    }
}

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

struct LstmCell {
    ih: Linear,
    hh: Linear,
    hidden: usize,
    /// Per-gate and cell-output norms, present for the layer-norm variant.
    norms: Option<(GradLayerNorm, GradLayerNorm)>,
}

impl LstmCell {
    fn new(input: usize, hidden: usize, layer_norm: bool, vb: VarBuilder) -> Result<Self> {
        let norms = if layer_norm {
            Some((
                GradLayerNorm::new(hidden, 1e-5, vb.pp("gate_norm"))?,
                GradLayerNorm::new(hidden, 1e-5, vb.pp("cell_norm"))?,
            ))
        } else {
            None
        };
        Ok(Self {
            ih: linear(input, 4 * hidden, vb.pp("ih"))?,
            hh: linear_no_bias(hidden, 4 * hidden, vb.pp("hh"))?,
            hidden,
            norms,
        })
    }

    fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = (self.ih.forward(x)? + self.hh.forward(h)?)?;
        let gates = match &self.norms {
            Some((gate_norm, _)) => {
                let (b, _) = gates.dims2()?;
                gate_norm
                    .forward(&gates.reshape((b, 4, self.hidden))?)?
                    .reshape((b, 4 * self.hidden))?
            }
            None => gates,
        };
        let hd = self.hidden;
        let i = grad_sigmoid(&gates.narrow(1, 0, hd)?)?;
        // forget bias of 1.0
        let f = grad_sigmoid(&(gates.narrow(1, hd, hd)? + 1.0)?)?;
        let g = gates.narrow(1, 2 * hd, hd)?.tanh()?;
        let o = grad_sigmoid(&gates.narrow(1, 3 * hd, hd)?)?;
        let c_next = ((f * c)? + (i * g)?)?;
        let c_out = match &self.norms {
            Some((_, cell_norm)) => cell_norm.forward(&c_next)?,
            None => c_next.clone(),
        };
        let h_next = (o * c_out.tanh()?)?;
        Ok((h_next, c_next))
    }
}

struct GruCell {
    ih: Linear,
    hh: Linear,
    hidden: usize,
}

impl GruCell {
    fn new(input: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ih: linear(input, 3 * hidden, vb.pp("ih"))?,
            hh: linear(hidden, 3 * hidden, vb.pp("hh"))?,
            hidden,
        })
    }

    fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let hd = self.hidden;
        let xi = self.ih.forward(x)?;
        let hi = self.hh.forward(h)?;
        let r = grad_sigmoid(&(xi.narrow(1, 0, hd)? + hi.narrow(1, 0, hd)?)?)?;
        let z = grad_sigmoid(&(xi.narrow(1, hd, hd)? + hi.narrow(1, hd, hd)?)?)?;
        let n = (xi.narrow(1, 2 * hd, hd)? + (r * hi.narrow(1, 2 * hd, hd)?)?)?.tanh()?;
        let keep = (z.neg()? + 1.0)?;
        ((keep * n)? + (z * h)?).map_err(Into::into)
    }
}

enum Cell {
    Lstm(LstmCell),
    Gru(GruCell),
}

// ---------------------------------------------------------------------------
// CellStack
// ---------------------------------------------------------------------------

/// `num_layers` recurrent cells of one kind, with output dropout per layer.
pub struct CellStack {
    kind: CellKind,
    layers: Vec<Cell>,
    hidden: usize,
    dropout: Dropout,
}

impl CellStack {
    pub fn new(
        kind: CellKind,
        input: usize,
        hidden: usize,
        num_layers: usize,
        dropout_prob: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input } else { hidden };
            let lvb = vb.pp(format!("layer_{i}"));
            layers.push(match kind {
                CellKind::Lstm => Cell::Lstm(LstmCell::new(in_dim, hidden, false, lvb)?),
                CellKind::LayerNormLstm => Cell::Lstm(LstmCell::new(in_dim, hidden, true, lvb)?),
                CellKind::Gru => Cell::Gru(GruCell::new(in_dim, hidden, lvb)?),
            });
        }
        Ok(Self {
            kind,
            layers,
            hidden,
            dropout: Dropout::new(dropout_prob as f32),
        })
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> Result<CellState> {
        let zeros = || Tensor::zeros((batch, self.hidden), DType::F32, device);
        let layers = self
            .layers
            .iter()
            .map(|cell| {
                Ok(LayerState {
                    h: zeros()?,
                    c: match cell {
                        Cell::Lstm(_) => Some(zeros()?),
                        Cell::Gru(_) => None,
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CellState { layers })
    }

    /// One timestep through every layer. Returns (top output, next state).
    pub fn step(&self, x: &Tensor, state: &CellState, train: bool) -> Result<(Tensor, CellState)> {
        anyhow::ensure!(
            state.layers.len() == self.layers.len(),
            "state has {} layers, stack has {}",
            state.layers.len(),
            self.layers.len()
        );
        let mut input = x.clone();
        let mut next = Vec::with_capacity(self.layers.len());
        for (cell, prev) in self.layers.iter().zip(&state.layers) {
            let layer = match (cell, &prev.c) {
                (Cell::Lstm(lstm), Some(c)) => {
                    let (h, c) = lstm.step(&input, &prev.h, c)?;
                    LayerState { h, c: Some(c) }
                }
                (Cell::Gru(gru), None) => LayerState {
                    h: gru.step(&input, &prev.h)?,
                    c: None,
                },
                _ => anyhow::bail!("cell state does not match {:?} layer", self.kind),
            };
            input = self.dropout.forward(&layer.h, train)?;
            next.push(layer);
        }
        Ok((input, CellState { layers: next }))
    }
}
