//! Pipeline stage / device allocation search for distributed training.
//!
//! A model is given as a linear sequence of coarse-grained subgraphs ("nodes"). The search picks how
//! the nodes are grouped into pipeline stages, how many devices every stage gets, how many replicas
//! of the pipeline exist, and how many micro-batches the global batch is split into, minimizing an
//! estimated step time under a per-device memory limit.
//!
//! ```ignore
//! let graph = Graph::from_json(&std::fs::read_to_string("graph.json")?)?;
//! let oracle = FlopsProfiler { device_flops: 1e12, ..Default::default() };
//! let comm = BandwidthProfiler::default();
//! let solution = DpStaging::new(&graph, &config, &oracle, &comm).run()?;
//! ```

use smallvec::SmallVec;

pub mod config;
pub mod dp;
pub mod error;
pub mod graph;
pub mod merge;
pub mod profiler;
pub mod search;
pub mod solution;

pub use config::SearchConfig;
pub use dp::AllocDp;
pub use error::SearchError;
pub use graph::{Edge, Graph, Node, NodeIndex, Value, ValueIndex, ValueKind};
pub use merge::{Composite, CompositeIndex, MergeCache, MergeKey};
pub use profiler::{BandwidthProfiler, CommunicationProfiler, CostOracle, FlopsProfiler, Profile, ProfileCache};
pub use search::DpStaging;
pub use solution::{AllocSolution, FileSolutionStore, SolutionKey, SolutionStore};

pub type SVec<T, const N: usize = 3> = SmallVec<[T; N]>;

#[macro_export]
macro_rules! new_index_type {
    ($visibility: vis, $type_name: ident) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        $visibility struct $type_name(pub usize);

        impl<T: Into<$type_name>> std::ops::Add<T> for $type_name {
            type Output = $type_name;

            fn add(self, rhs: T) -> $type_name {
                $type_name(self.0 + rhs.into().0)
            }
        }

        impl From<usize> for $type_name {
            fn from(x: usize) -> $type_name {
                $type_name(x)
            }
        }
    }
}

pub(crate) fn is_power_of_two(x: usize) -> bool {
    x != 0 && x & (x - 1) == 0
}
