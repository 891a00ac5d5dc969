use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SearchError;
use crate::merge::Composite;

/// The chosen stage layout. `boundaries` and `dev_nums` have one more entry than `graphs`: stage `i`
/// covers nodes `boundaries[i]..boundaries[i+1]` and uses `dev_nums[i+1] - dev_nums[i]` devices of a
/// group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocSolution {
    pub graphs: Vec<Rc<Composite>>,
    pub repl_nums: BTreeMap<String, usize>, // composite id -> devices for the stage across all replicas
    pub part_info: BTreeMap<String, Rc<Composite>>, // the graph handed to deployment, not partitioned here
    pub pipeline_num: usize,
    pub checkpointing: bool,
    pub boundaries: Vec<usize>,
    pub dev_nums: Vec<usize>,
}

impl AllocSolution {
    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    pub fn stage_num(&self) -> usize {
        self.graphs.len()
    }

    pub fn repl_num(&self, stage: usize) -> usize {
        self.repl_nums[&self.graphs[stage].id]
    }

    /// Checks that the layout covers exactly `n_nodes` nodes and every stage has a device count.
    pub fn check_layout(&self, n_nodes: usize) -> Result<(), SearchError> {
        let stage_num = self.stage_num();
        let invalid = |msg: String| Err(SearchError::InvalidGraph(msg));

        if self.boundaries.len() != stage_num + 1 || self.dev_nums.len() != stage_num + 1 {
            return invalid(format!("{stage_num} stages with boundaries {:?} and dev_nums {:?}", self.boundaries, self.dev_nums))
        }
        if self.boundaries.first() != Some(&0) || self.boundaries.last() != Some(&n_nodes) {
            return invalid(format!("boundaries {:?} do not cover {n_nodes} nodes", self.boundaries))
        }
        for (i, sg) in self.graphs.iter().enumerate() {
            if (sg.key.from, sg.key.to + 1) != (self.boundaries[i], self.boundaries[i + 1]) {
                return invalid(format!("stage {i} is {} but its boundaries are {}..{}", sg.id, self.boundaries[i], self.boundaries[i + 1]))
            }
            if !self.repl_nums.contains_key(&sg.id) {
                return invalid(format!("stage {i} ({}) has no replica count", sg.id))
            }
        }
        Ok(())
    }

    /// Devices used by all stages of all replicas.
    pub fn total_devices(&self) -> usize {
        self.repl_nums.values().sum()
    }
}

/// Identifies one configuration of the sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SolutionKey {
    pub stage_num: usize,
    pub dev_num_per_group: usize,
    pub pipeline_num: usize,
}

/// Persistence of per-configuration DP results. `None` records that the configuration has no solution.
pub trait SolutionStore {
    fn load(&self, key: SolutionKey) -> Result<Option<AllocSolution>, SearchError>;
    fn save(&self, key: SolutionKey, solution: Option<&AllocSolution>) -> Result<(), SearchError>;
}

/// One bincode file per key: `{prefix}_s{stage}_g{group}_p{pipeline}.bin`.
pub struct FileSolutionStore {
    prefix: String,
}

impl FileSolutionStore {
    pub fn new(prefix: impl Into<String>) -> FileSolutionStore {
        FileSolutionStore { prefix: prefix.into() }
    }

    pub fn file_name(&self, key: SolutionKey) -> PathBuf {
        PathBuf::from(format!("{}_s{}_g{}_p{}.bin", self.prefix, key.stage_num, key.dev_num_per_group, key.pipeline_num))
    }
}

impl SolutionStore for FileSolutionStore {
    fn load(&self, key: SolutionKey) -> Result<Option<AllocSolution>, SearchError> {
        let file = self.file_name(key);
        info!("loading an allocation from {}", file.display());
        let bytes = std::fs::read(&file).map_err(SearchError::io(&file))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn save(&self, key: SolutionKey, solution: Option<&AllocSolution>) -> Result<(), SearchError> {
        let file = self.file_name(key);
        info!("saving an allocation to {}", file.display());
        let bytes = bincode::serialize(&solution)?;
        std::fs::write(&file, bytes).map_err(SearchError::io(&file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::merge::MergeCache;

    fn two_stage_solution() -> AllocSolution {
        let g = Graph::chain(&[(1, 10, 4), (1, 20, 4), (1, 30, 4)]);
        let mut cache = MergeCache::new(&g);
        let a = cache.merge(0, 1);
        let b = cache.merge(2, 2);
        let graphs = vec![cache[a].clone(), cache[b].clone()];
        AllocSolution {
            repl_nums: graphs.iter().map(|c| (c.id.clone(), 2)).collect(),
            part_info: graphs.iter().map(|c| (c.id.clone(), c.clone())).collect(),
            graphs,
            pipeline_num: 2,
            checkpointing: true,
            boundaries: vec![0, 2, 3],
            dev_nums: vec![0, 1, 2],
        }
    }

    #[test]
    fn accessors() {
        let sol = two_stage_solution();
        assert!(!sol.is_empty());
        assert_eq!(sol.stage_num(), 2);
        assert_eq!(sol.repl_num(1), 2);
        assert_eq!(sol.total_devices(), 4);
        assert!(AllocSolution::default().is_empty());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSolutionStore::new(dir.path().join("sol").to_string_lossy());
        let key = |stage_num, dev_num_per_group, pipeline_num| SolutionKey { stage_num, dev_num_per_group, pipeline_num };
        assert!(store.file_name(key(3, 8, 4)).to_string_lossy().ends_with("sol_s3_g8_p4.bin"));

        let sol = two_stage_solution();
        store.save(key(2, 1, 2), Some(&sol)).unwrap();
        store.save(key(2, 4, 2), None).unwrap();
        store.save(key(5, 8, 1), None).unwrap();

        let back = store.load(key(2, 1, 2)).unwrap().unwrap();
        assert_eq!(back.boundaries, sol.boundaries);
        assert_eq!(back.dev_nums, sol.dev_nums);
        assert_eq!(*back.graphs[0], *sol.graphs[0]);
        assert_eq!(back.repl_nums, sol.repl_nums);
        assert!(back.checkpointing);

        // same stage and pipeline counts on a larger group is a separate entry
        assert!(store.load(key(2, 4, 2)).unwrap().is_none());
        assert!(store.load(key(5, 8, 1)).unwrap().is_none());
        assert!(matches!(store.load(key(7, 1, 7)), Err(SearchError::Io { .. })));
    }

    #[test]
    fn layout_must_match_graph() {
        let sol = two_stage_solution();
        assert!(sol.check_layout(3).is_ok());
        assert!(matches!(sol.check_layout(4), Err(SearchError::InvalidGraph(_))));

        let mut missing = sol.clone();
        missing.repl_nums.remove(&sol.graphs[1].id);
        assert!(matches!(missing.check_layout(3), Err(SearchError::InvalidGraph(_))));

        let mut shifted = sol.clone();
        shifted.boundaries = vec![0, 1, 3];
        assert!(matches!(shifted.check_layout(3), Err(SearchError::InvalidGraph(_))));

        assert!(AllocSolution::default().check_layout(0).is_err());
    }
}
