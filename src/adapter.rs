//! Recurrent policy adapter
//!
//! Wraps the memory engine as a state-in/state-out recurrent module for RL
//! training frameworks that batch rollouts as zero-padded windows. The
//! adapter owns the configuration surface, the input projection, the
//! default GNN, and the transport packing of the hidden state; the engine
//! never sees padding or transport concerns.

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::codec::{pack, unpack};
use crate::error::GcmError;
use crate::gnn::GraphConvStack;
use crate::indexing::pad_to_dense;
use crate::memory::SparseGcm;
use crate::positional::{PositionalEncoding, PositionalMode};
use crate::selector::EdgeSelector;
use crate::state::{GraphState, EDGE_SENTINEL, WEIGHT_FILL};
use crate::GcmResult;

/// Recognized configuration options. Unknown keys in serialized input are
/// rejected outright rather than silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SparseGcmConfig {
    /// Node capacity of each element's graph.
    pub graph_size: usize,
    /// Edge capacity of the packed transport state.
    pub max_edges: usize,
    /// Node feature width at the GNN boundary (before any positional
    /// columns are appended).
    pub gnn_input_size: usize,
    /// Belief vector width produced by the GNN.
    pub gnn_output_size: usize,
    /// Whether learned edge weights reach the GNN.
    pub edge_weights: bool,
    /// Widen the input with a one-hot encoding of the previous action.
    pub use_prev_action: bool,
    /// Action-space size; only read when `use_prev_action` is set.
    pub num_actions: usize,
    /// Positional signal mode: off, add, or cat.
    pub positional_encoding: PositionalMode,
    /// Columns reserved for the positional signal in `cat` mode.
    pub positional_encoding_dim: usize,
}

impl Default for SparseGcmConfig {
    fn default() -> Self {
        Self {
            graph_size: 32,
            max_edges: 64,
            gnn_input_size: 64,
            gnn_output_size: 64,
            edge_weights: false,
            use_prev_action: false,
            num_actions: 0,
            positional_encoding: PositionalMode::Off,
            positional_encoding_dim: 4,
        }
    }
}

impl SparseGcmConfig {
    /// Parse from JSON, failing on any unrecognized key.
    pub fn from_json(json: &str) -> GcmResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| GcmError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GcmResult<()> {
        if self.graph_size == 0 {
            return Err(GcmError::Configuration("graph_size must be nonzero".into()));
        }
        if self.max_edges == 0 {
            return Err(GcmError::Configuration("max_edges must be nonzero".into()));
        }
        if self.use_prev_action && self.num_actions == 0 {
            return Err(GcmError::Configuration(
                "use_prev_action requires a nonzero num_actions".into(),
            ));
        }
        if self.positional_encoding == PositionalMode::Cat && self.positional_encoding_dim == 0 {
            return Err(GcmError::Configuration(
                "cat positional encoding requires a nonzero positional_encoding_dim".into(),
            ));
        }
        Ok(())
    }
}

/// Unbatched per-element hidden state, the shape a sequence starts from.
#[derive(Debug, Clone)]
pub struct ElementState {
    pub nodes: Tensor,
    pub edges: Tensor,
    pub weights: Tensor,
    pub t: usize,
}

/// Sequential composition of per-node transforms: the input projection
/// followed by any caller-supplied preprocessor stages.
struct Preprocessor {
    stages: Vec<Box<dyn Module>>,
}

impl Module for Preprocessor {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = xs.clone();
        for stage in &self.stages {
            h = stage.forward(&h)?;
        }
        Ok(h)
    }
}

/// State-in/state-out recurrence over the graph memory.
pub struct RecurrentGcm {
    gcm: SparseGcm,
    config: SparseGcmConfig,
    input_dim: usize,
    device: Device,
}

impl RecurrentGcm {
    /// Build the adapter for `obs_dim`-wide flattened observations. The
    /// caller may append preprocessor stages (run after the input
    /// projection; freeze their vars in the optimizer to keep them fixed)
    /// and selector chains before the first forward call.
    pub fn new(
        obs_dim: usize,
        config: SparseGcmConfig,
        vb: VarBuilder,
        device: &Device,
    ) -> GcmResult<Self> {
        config.validate()?;
        let input_dim = obs_dim
            + if config.use_prev_action {
                config.num_actions
            } else {
                0
            };

        let projection = linear(input_dim, config.gnn_input_size, vb.pp("projection"))?;
        let preprocessor = Preprocessor {
            stages: vec![Box::new(projection)],
        };

        let gnn_in = match config.positional_encoding {
            PositionalMode::Cat => config.gnn_input_size + config.positional_encoding_dim,
            _ => config.gnn_input_size,
        };
        let gnn = GraphConvStack::new(
            &[gnn_in, config.gnn_output_size, config.gnn_output_size],
            vb.pp("gnn"),
        )?;

        let mut gcm = SparseGcm::new(Box::new(gnn), config.graph_size)?
            .with_preprocessor(Box::new(preprocessor))
            .with_edge_weights(config.edge_weights);
        if config.positional_encoding != PositionalMode::Off {
            let dim = match config.positional_encoding {
                PositionalMode::Add => config.gnn_input_size,
                _ => config.positional_encoding_dim,
            };
            gcm = gcm.with_positional_encoding(PositionalEncoding::new(
                config.graph_size,
                config.positional_encoding,
                dim,
                device,
            )?);
        }

        Ok(Self {
            gcm,
            config,
            input_dim,
            device: device.clone(),
        })
    }

    /// Append a preprocessor stage after the input projection.
    pub fn with_preprocessor(mut self, stage: Box<dyn Module>) -> Self {
        // The engine's preprocessor is rebuilt as a chain around the
        // existing one.
        struct Tail {
            head: Box<dyn Module>,
            tail: Box<dyn Module>,
        }
        impl Module for Tail {
            fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
                self.tail.forward(&self.head.forward(xs)?)
            }
        }
        self.gcm = self.gcm.map_preprocessor(|head| match head {
            Some(head) => Box::new(Tail { head, tail: stage }),
            None => stage,
        });
        self
    }

    /// Selectors run on raw (pre-projection) node features.
    pub fn with_edge_selectors(mut self, selectors: Vec<Box<dyn EdgeSelector>>) -> Self {
        self.gcm = self.gcm.with_edge_selectors(selectors);
        self
    }

    /// Selectors run after projection and positional encoding.
    pub fn with_aux_edge_selectors(mut self, selectors: Vec<Box<dyn EdgeSelector>>) -> Self {
        self.gcm = self.gcm.with_aux_edge_selectors(selectors);
        self
    }

    pub fn config(&self) -> &SparseGcmConfig {
        &self.config
    }

    /// Input feature width the hidden-state nodes carry (observation plus
    /// any one-hot action columns).
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Fresh unbatched state for one sequence: zero nodes, sentinel
    /// edges, fill weights, zero watermark.
    pub fn initial_state(&self) -> GcmResult<ElementState> {
        let cfg = &self.config;
        Ok(ElementState {
            nodes: Tensor::zeros((cfg.graph_size, self.input_dim), DType::F32, &self.device)?,
            edges: Tensor::full(EDGE_SENTINEL, (2, cfg.max_edges), &self.device)?,
            weights: Tensor::full(WEIGHT_FILL as f32, (1, cfg.max_edges), &self.device)?,
            t: 0,
        })
    }

    /// Stack per-element states into the batched transport form.
    pub fn stack_states(&self, elements: &[ElementState]) -> GcmResult<GraphState> {
        let nodes = Tensor::stack(
            &elements.iter().map(|e| e.nodes.clone()).collect::<Vec<_>>(),
            0,
        )?;
        let edges = Tensor::stack(
            &elements.iter().map(|e| e.edges.clone()).collect::<Vec<_>>(),
            0,
        )?;
        let weights = Tensor::stack(
            &elements
                .iter()
                .map(|e| e.weights.clone())
                .collect::<Vec<_>>(),
            0,
        )?;
        GraphState::from_parts(nodes, edges, weights, elements.iter().map(|e| e.t).collect())
    }

    /// One recurrent update over a zero-padded window.
    ///
    /// `obs` is `[B, t_max, obs_dim]`; only `[0, seq_lens[b])` of each
    /// element's time axis is read. `prev_actions` (`[B, t_max]` indices)
    /// is required exactly when the configuration enables it. The returned
    /// beliefs are re-padded to `[B, max(seq_lens), gnn_output_size]` with
    /// zero fill, and the state comes back packed to `max_edges`.
    pub fn forward(
        &self,
        obs: &Tensor,
        prev_actions: Option<&Tensor>,
        seq_lens: &[usize],
        state: Option<&GraphState>,
    ) -> GcmResult<(Tensor, GraphState)> {
        let (b, t_max, obs_dim) = obs.dims3()?;
        let action_dim = if self.config.use_prev_action {
            self.config.num_actions
        } else {
            0
        };
        if obs_dim + action_dim != self.input_dim {
            return Err(GcmError::DimensionMismatch {
                expected: self.input_dim - action_dim,
                got: obs_dim,
            });
        }

        let x = if self.config.use_prev_action {
            let actions = prev_actions.ok_or_else(|| {
                GcmError::InvalidParameter(
                    "use_prev_action is enabled but no prev_actions were supplied".into(),
                )
            })?;
            let encoded = one_hot(actions, self.config.num_actions)?;
            Tensor::cat(&[obs, &encoded], 2)?
        } else {
            obs.clone()
        };

        if seq_lens.len() != b || seq_lens.iter().any(|&l| l > t_max) {
            return Err(GcmError::InvalidParameter(format!(
                "seq_lens must hold {b} entries within [0, {t_max}]"
            )));
        }

        let working = state.map(unpack).transpose()?;
        let (beliefs, new_state) = self.gcm.step(&x, seq_lens, working)?;

        let padded = if beliefs.dim(0)? == 0 {
            Tensor::zeros(
                (b, 0, self.config.gnn_output_size),
                DType::F32,
                &self.device,
            )?
        } else {
            pad_to_dense(&beliefs, seq_lens)?
        };
        let packed = pack(&new_state, self.config.max_edges)?;
        Ok((padded, packed))
    }
}

/// One-hot encode `[B, T]` action indices into `[B, T, depth]` floats.
fn one_hot(indices: &Tensor, depth: usize) -> GcmResult<Tensor> {
    let (b, t) = indices.dims2()?;
    let flat: Vec<u32> = indices
        .to_dtype(DType::U32)?
        .flatten_all()?
        .to_vec1::<u32>()?;
    let mut data = vec![0f32; b * t * depth];
    for (row, &action) in flat.iter().enumerate() {
        if (action as usize) < depth {
            data[row * depth + action as usize] = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (b, t, depth), indices.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn adapter(obs_dim: usize, config: SparseGcmConfig) -> RecurrentGcm {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        RecurrentGcm::new(obs_dim, config, vb, &dev).unwrap()
    }

    #[test]
    fn test_config_default_round_trips_json() {
        let config = SparseGcmConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = SparseGcmConfig::from_json(&json).unwrap();
        assert_eq!(parsed.graph_size, config.graph_size);
        assert_eq!(parsed.positional_encoding, PositionalMode::Off);
    }

    #[test]
    fn test_unknown_config_key_is_fatal() {
        let err = SparseGcmConfig::from_json(r#"{"graph_size": 8, "graph_sizes": 9}"#);
        assert!(matches!(err, Err(GcmError::Configuration(_))));
    }

    #[test]
    fn test_forward_pads_to_window() {
        let dev = Device::Cpu;
        let config = SparseGcmConfig {
            graph_size: 8,
            max_edges: 16,
            gnn_input_size: 8,
            gnn_output_size: 8,
            ..Default::default()
        };
        let model = adapter(5, config).with_edge_selectors(vec![Box::new(
            crate::selector::TemporalBackedge,
        )]);
        let obs = Tensor::rand(-1f32, 1f32, (2, 3, 5), &dev).unwrap();
        let (out, state) = model.forward(&obs, None, &[1, 3], None).unwrap();
        assert_eq!(out.dims(), &[2, 3, 8]);
        // Padded rows are exactly zero.
        let rows = out.to_vec3::<f32>().unwrap();
        assert_eq!(rows[0][1], vec![0f32; 8]);
        assert_eq!(rows[0][2], vec![0f32; 8]);
        assert_eq!(state.t(), &[1, 3]);
        assert_eq!(state.edge_capacity(), 16);
    }

    #[test]
    fn test_recurrence_across_windows() {
        let dev = Device::Cpu;
        let config = SparseGcmConfig {
            graph_size: 16,
            max_edges: 32,
            gnn_input_size: 8,
            gnn_output_size: 8,
            ..Default::default()
        };
        let model = adapter(4, config).with_edge_selectors(vec![Box::new(
            crate::selector::TemporalBackedge,
        )]);
        let mut state: Option<GraphState> = None;
        for _ in 0..3 {
            let obs = Tensor::rand(-1f32, 1f32, (2, 2, 4), &dev).unwrap();
            let (_, next) = model.forward(&obs, None, &[2, 2], state.as_ref()).unwrap();
            state = Some(next);
        }
        assert_eq!(state.unwrap().t(), &[6, 6]);
    }

    #[test]
    fn test_prev_action_widens_input() {
        let config = SparseGcmConfig {
            graph_size: 8,
            max_edges: 8,
            gnn_input_size: 8,
            gnn_output_size: 8,
            use_prev_action: true,
            num_actions: 3,
            ..Default::default()
        };
        let model = adapter(5, config);
        assert_eq!(model.input_dim(), 8);

        let dev = Device::Cpu;
        let obs = Tensor::rand(-1f32, 1f32, (1, 2, 5), &dev).unwrap();
        let actions = Tensor::from_vec(vec![0u32, 2], (1, 2), &dev).unwrap();
        let (out, _) = model
            .forward(&obs, Some(&actions), &[2], None)
            .unwrap();
        assert_eq!(out.dims(), &[1, 2, 8]);
        // Forgetting the actions is an error, not a silent zero-fill.
        assert!(model.forward(&obs, None, &[2], None).is_err());
    }

    #[test]
    fn test_initial_state_shapes() {
        let config = SparseGcmConfig {
            graph_size: 8,
            max_edges: 4,
            gnn_input_size: 8,
            gnn_output_size: 8,
            ..Default::default()
        };
        let model = adapter(6, config);
        let element = model.initial_state().unwrap();
        assert_eq!(element.nodes.dims(), &[8, 6]);
        assert_eq!(element.edges.dims(), &[2, 4]);
        assert_eq!(element.weights.dims(), &[1, 4]);
        assert_eq!(element.t, 0);

        let batched = model
            .stack_states(&[element.clone(), element])
            .unwrap();
        assert_eq!(batched.t(), &[0, 0]);
        assert!(batched.edge_lists().unwrap().iter().all(Vec::is_empty));
    }
}
