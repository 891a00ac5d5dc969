use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::Add;

use serde::{Deserialize, Serialize};

use crate::merge::{Composite, MergeKey};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub fwd_time: f64,
    pub bwd_time: f64,
    pub max_allocated_mem: u64,
}

impl Profile {
    /// What an oracle reports when profiling itself failed (e.g. ran out of memory). It never fits.
    pub fn infeasible() -> Profile {
        Profile { fwd_time: f64::INFINITY, bwd_time: f64::INFINITY, max_allocated_mem: u64::MAX }
    }
}

impl Add for Profile {
    type Output = Profile;

    fn add(self, rhs: Profile) -> Profile {
        Profile {
            fwd_time: self.fwd_time + rhs.fwd_time,
            bwd_time: self.bwd_time + rhs.bwd_time,
            max_allocated_mem: self.max_allocated_mem.saturating_add(rhs.max_allocated_mem)
        }
    }
}

/// Measures (or estimates) a composite running on `dev_num` data-parallel devices with the batch
/// split into `pipeline_num` micro-batches. Must return the same profile for the same inputs.
pub trait CostOracle {
    fn profile(&self, graph: &Composite, dev_num: usize, pipeline_num: usize, checkpointing: bool) -> Profile;
}

impl<F> CostOracle for F where F: Fn(&Composite, usize, usize, bool) -> Profile {
    fn profile(&self, graph: &Composite, dev_num: usize, pipeline_num: usize, checkpointing: bool) -> Profile {
        self(graph, dev_num, pipeline_num, checkpointing)
    }
}

pub trait CommunicationProfiler {
    /// time to move `size` bytes between two stages
    fn comm_time(&self, size: f64) -> f64;

    /// time to all-reduce gradients of `size` bytes among the replicas of a stage
    fn all_reduce_time(&self, size: u64) -> f64;
}

type ProfileKey = (MergeKey, usize, usize, bool);

/// Memoizes oracle calls by (composite, devices, pipelines, checkpointing).
pub struct ProfileCache<'o> {
    oracle: &'o dyn CostOracle,
    cache: RefCell<BTreeMap<ProfileKey, Profile>>,
    hits: Cell<usize>,
}

impl<'o> ProfileCache<'o> {
    pub fn new(oracle: &'o dyn CostOracle) -> ProfileCache<'o> {
        ProfileCache { oracle, cache: Default::default(), hits: Cell::new(0) }
    }

    pub fn profile(&self, graph: &Composite, dev_num: usize, pipeline_num: usize, checkpointing: bool) -> Profile {
        let key = (graph.key, dev_num, pipeline_num, checkpointing);
        if let Some(profile) = self.cache.borrow().get(&key) {
            self.hits.set(self.hits.get() + 1);
            return *profile
        }

        let profile = self.oracle.profile(graph, dev_num, pipeline_num, checkpointing);
        self.cache.borrow_mut().insert(key, profile);
        profile
    }

    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.borrow().is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits.get()
    }

    pub fn clear(&self) {
        self.cache.borrow_mut().clear();
        self.hits.set(0)
    }
}

/// Analytic oracle: time is proportional to flops, memory is the replicated parameters and
/// optimizer state plus the activations kept for the backward pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlopsProfiler {
    pub device_flops: f64,
    pub backward_ratio: f64,
    pub param_mem_ratio: f64, // parameters + gradients + optimizer states, relative to the parameter size
}

impl Default for FlopsProfiler {
    fn default() -> Self {
        FlopsProfiler { device_flops: 1e12, backward_ratio: 2.0, param_mem_ratio: 4.0 }
    }
}

impl CostOracle for FlopsProfiler {
    fn profile(&self, graph: &Composite, dev_num: usize, pipeline_num: usize, checkpointing: bool) -> Profile {
        let share = (dev_num * pipeline_num) as f64;
        let fwd_time = graph.flops as f64 / self.device_flops / share;
        let mut bwd_time = fwd_time * self.backward_ratio;
        if checkpointing {
            bwd_time += fwd_time // recomputation
        }

        let kept = if checkpointing { graph.input_size } else { graph.input_size + graph.output_size };
        let activations = (kept as f64 / share).ceil() as u64 * pipeline_num as u64; // all micro-batches in flight
        let params = (graph.param_size as f64 * self.param_mem_ratio) as u64;

        Profile { fwd_time, bwd_time, max_allocated_mem: params + activations }
    }
}

/// Bytes per second for point-to-point transfers and for gradient all-reduce.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthProfiler {
    pub bandwidth: f64,
    pub all_reduce_bandwidth: f64,
}

impl Default for BandwidthProfiler {
    fn default() -> Self {
        BandwidthProfiler { bandwidth: 10e9, all_reduce_bandwidth: 5e9 }
    }
}

impl BandwidthProfiler {
    /// Communication is free. Useful when only computation should decide the split.
    pub fn free() -> BandwidthProfiler {
        BandwidthProfiler { bandwidth: f64::INFINITY, all_reduce_bandwidth: f64::INFINITY }
    }
}

impl CommunicationProfiler for BandwidthProfiler {
    fn comm_time(&self, size: f64) -> f64 {
        size / self.bandwidth
    }

    fn all_reduce_time(&self, size: u64) -> f64 {
        size as f64 / self.all_reduce_bandwidth
    }
}
