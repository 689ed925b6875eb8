//! Neural network evaluation.
//!
//! A position is classified into one of three [`NetClass`]es, each with its
//! own network. Every network maps an encoded position to five probabilities
//! (see [`Outputs`]). An optional second set of smaller pruning networks is
//! used for cheap pre-selection.

pub mod network;
pub mod sigmoid;
pub mod simd;
pub mod state;

use std::path::Path;

pub use network::{NetParams, NeuralNet};
pub use simd::Backend;
pub use state::{ClassStates, IncrementalState, StateMarker};

use crate::error::WeightsError;

/// Outputs per evaluation.
pub const NUM_OUTPUTS: usize = 5;

/// Number of network classes.
pub const NUM_NET_CLASSES: usize = 3;

/// Win, win-gammon, win-backgammon, lose-gammon, lose-backgammon,
/// for the player on roll.
pub type Outputs = [f32; NUM_OUTPUTS];

pub const OUTPUT_WIN: usize = 0;
pub const OUTPUT_WIN_GAMMON: usize = 1;
pub const OUTPUT_WIN_BACKGAMMON: usize = 2;
pub const OUTPUT_LOSE_GAMMON: usize = 3;
pub const OUTPUT_LOSE_BACKGAMMON: usize = 4;

/// Which network evaluates a position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NetClass {
    /// General positions with contact between the sides.
    Contact,
    /// No contact left.
    Race,
    /// One side has most of its checkers borne off or stacked.
    Crashed,
}

impl NetClass {
    /// File order of the nets.
    pub const ALL: [NetClass; NUM_NET_CLASSES] = [NetClass::Contact, NetClass::Race, NetClass::Crashed];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            NetClass::Contact => 0,
            NetClass::Race => 1,
            NetClass::Crashed => 2,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            NetClass::Contact => "contact",
            NetClass::Race => "race",
            NetClass::Crashed => "crashed",
        }
    }
}

/// The class networks plus optional pruning networks.
#[derive(Clone, Debug)]
pub struct NetworkSet {
    nets: [NeuralNet; NUM_NET_CLASSES],
    pruning: Option<[NeuralNet; NUM_NET_CLASSES]>,
}

impl NetworkSet {
    /// Group loaded nets: 3 class nets, optionally followed by 3 pruning nets,
    /// each in [`NetClass::ALL`] order.
    pub fn from_nets(nets: Vec<NeuralNet>) -> Result<Self, WeightsError> {
        if nets.len() != NUM_NET_CLASSES && nets.len() != 2 * NUM_NET_CLASSES {
            return Err(WeightsError::NetCount { found: nets.len() });
        }
        for (i, net) in nets.iter().enumerate() {
            if net.outputs() != NUM_OUTPUTS {
                return Err(WeightsError::OutputMismatch {
                    net: i,
                    expected: NUM_OUTPUTS,
                    found: net.outputs(),
                });
            }
        }

        let mut iter = nets.into_iter();
        let mut take3 = || -> Option<[NeuralNet; NUM_NET_CLASSES]> {
            Some([iter.next()?, iter.next()?, iter.next()?])
        };
        let main = take3().ok_or(WeightsError::NetCount { found: 0 })?;
        let pruning = take3();

        Ok(Self {
            nets: main,
            pruning,
        })
    }

    /// Load a weights file (text or binary).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WeightsError> {
        let path = path.as_ref();
        let set = Self::from_nets(network::load_nets(path)?)?;
        log::debug!(
            "loaded {} nets from {} ({} backend)",
            set.iter().count(),
            path.display(),
            set.nets[0].backend().name()
        );
        Ok(set)
    }

    /// Write every net in the binary format.
    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        network::save_binary_nets(path, self.iter())
    }

    #[inline]
    #[must_use]
    pub fn net(&self, class: NetClass) -> &NeuralNet {
        &self.nets[class.index()]
    }

    #[inline]
    #[must_use]
    pub fn pruning(&self, class: NetClass) -> Option<&NeuralNet> {
        self.pruning.as_ref().map(|p| &p[class.index()])
    }

    #[must_use]
    pub fn has_pruning(&self) -> bool {
        self.pruning.is_some()
    }

    /// Class nets then pruning nets, in file order.
    pub fn iter(&self) -> impl Iterator<Item = &NeuralNet> {
        self.nets.iter().chain(self.pruning.iter().flatten())
    }

    /// Largest input layer across all nets.
    #[must_use]
    pub fn max_inputs(&self) -> usize {
        self.iter().map(NeuralNet::inputs).max().unwrap_or(0)
    }

    /// Force a kernel backend on every net.
    pub fn set_backend(&mut self, backend: Backend) {
        for net in self.nets.iter_mut().chain(self.pruning.iter_mut().flatten()) {
            net.set_backend(backend);
        }
    }
}
