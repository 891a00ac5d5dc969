use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::dp::{AllocDp, DpParams};
use crate::error::SearchError;
use crate::graph::{Graph, NodeIndex};
use crate::merge::{Composite, MergeCache};
use crate::profiler::{CommunicationProfiler, CostOracle, Profile, ProfileCache};
use crate::solution::{AllocSolution, FileSolutionStore, SolutionKey, SolutionStore};

/// Sweeps device groups, stage counts and pipeline counts, solves the allocation DP for each, and
/// keeps the solution with the lowest estimated step time.
pub struct DpStaging<'a> {
    graph: &'a Graph,
    config: SearchConfig,
    merge_cache: MergeCache<'a>,
    profiles: ProfileCache<'a>,
    comm: &'a dyn CommunicationProfiler,
    store: Option<Box<dyn SolutionStore + 'a>>,
}

#[derive(Debug, Serialize)]
pub struct NodeProfileReport {
    pub total_dev_num: usize,
    pub node_profiles: Vec<NodeProfileEntry>,
}

#[derive(Debug, Serialize)]
pub struct NodeProfileEntry {
    pub index: usize,
    pub name: String,
    pub param_size: u64,
    pub input_size: u64,
    pub output_size: u64,
    pub profiles: Vec<ProfileSample>,
}

#[derive(Debug, Serialize)]
pub struct ProfileSample {
    pub global_batch_size: usize,
    pub prof_batch_size: usize,
    pub dev_num: usize,
    pub pipeline_num: usize,
    pub checkpointing: bool,
    pub fwd_time: f64,
    pub bwd_time: f64,
    pub max_allocated_mem: u64,
}

impl<'a> DpStaging<'a> {
    pub fn new(graph: &'a Graph, config: &SearchConfig, oracle: &'a dyn CostOracle, comm: &'a dyn CommunicationProfiler) -> DpStaging<'a> {
        let store: Option<Box<dyn SolutionStore + 'a>> = if config.load_alloc_solutions || config.save_alloc_solutions {
            Some(Box::new(FileSolutionStore::new(config.alloc_solutions_file_prefix.clone())))
        } else {
            None
        };

        DpStaging {
            graph,
            config: config.clone(),
            merge_cache: MergeCache::new(graph),
            profiles: ProfileCache::new(oracle),
            comm,
            store
        }
    }

    /// Replaces the file store used by `load_alloc_solutions` / `save_alloc_solutions`.
    pub fn with_store(mut self, store: impl SolutionStore + 'a) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn profiles(&self) -> &ProfileCache<'a> {
        &self.profiles
    }

    pub fn run(&mut self) -> Result<AllocSolution, SearchError> {
        self.config.validate()?;
        if self.graph.n_nodes() == 0 {
            return Err(SearchError::InvalidGraph("the graph has no nodes".into()))
        }

        let dev_num = self.config.total_device_count;
        let dev_per_node = self.config.dev_per_node();
        if dev_num % dev_per_node != 0 {
            warn!("the numbers of devices may differ across nodes");
        }
        let node_num_total = dev_num / dev_per_node;
        let layer_num = self.graph.n_nodes();

        debug!("searching allocations: batch_size={} dev_num={} pipeline_range={:?}", self.config.batch_size, dev_num, self.config.pipeline_range());

        if let Some(path) = self.config.dump_node_profiles.clone() {
            self.dump_node_profiles(&path)?;
        }

        let pipeline_nums: Vec<_> = self.config.pipeline_nums().collect();
        let mut solutions = vec![];
        let mut prev_stage_num_max = 0;

        for node_num_used in 1..=node_num_total {
            if node_num_total % node_num_used != 0 {
                continue
            }

            let dev_num_per_group = dev_per_node * node_num_used;
            let replica_num = node_num_total / node_num_used;

            let (stage_num_min, stage_num_max) = if self.config.forced_stage_num != 0 {
                (self.config.forced_stage_num, self.config.forced_stage_num)
            } else {
                let range = (prev_stage_num_max + 1, dev_num_per_group);
                prev_stage_num_max = dev_num_per_group;
                range
            };

            // the graph can be very small
            let stage_num_min = stage_num_min.min(layer_num);
            let stage_num_max = stage_num_max.min(layer_num);

            // every stage count of the group is tried, only larger groups are skipped
            for stage_num in stage_num_min..=stage_num_max {
                for &pipeline_num in &pipeline_nums {
                    let p = DpParams { stage_num, dev_num_per_group, replica_num, pipeline_num, checkpointing: pipeline_num > 1 };
                    debug!("searching: #nodes={node_num_used} #dev_per_node={dev_per_node} #stages={stage_num} replica_num={replica_num} pipeline_num={pipeline_num}");

                    if let Some(sol) = self.solve_or_load(p)? {
                        solutions.push(sol)
                    }
                }
            }

            if !self.config.exhaustive_search && !solutions.is_empty() {
                break
            }
        }

        if solutions.is_empty() {
            return Err(SearchError::NoFeasibleAllocation)
        }
        info!("found {} feasible allocations", solutions.len());

        let mut best: Option<(f64, AllocSolution)> = None;
        for sol in solutions {
            let time = self.estimate_time(&sol);
            if best.as_ref().map(|(t, _)| time < *t).unwrap_or(true) {
                best = Some((time, sol))
            }
        }

        let (best_time, best_sol) = best.ok_or(SearchError::NoFeasibleAllocation)?;
        self.log_solution(&best_sol, best_time);
        Ok(best_sol)
    }

    fn solve_or_load(&mut self, p: DpParams) -> Result<Option<AllocSolution>, SearchError> {
        let key = SolutionKey { stage_num: p.stage_num, dev_num_per_group: p.dev_num_per_group, pipeline_num: p.pipeline_num };

        if let Some(store) = &self.store {
            if self.config.load_alloc_solutions {
                let sol = store.load(key)?;
                if let Some(sol) = &sol {
                    sol.check_layout(self.graph.n_nodes())?;
                }
                return Ok(sol)
            }
        }

        let mut dp = AllocDp {
            graph: self.graph,
            config: &self.config,
            merge_cache: &mut self.merge_cache,
            profiles: &self.profiles,
            comm: self.comm,
        };
        let sol = dp.solve(p);

        if let Some(store) = &self.store {
            if self.config.save_alloc_solutions {
                store.save(key, sol.as_ref())?;
            }
        }
        Ok(sol)
    }

    fn stage_profile(&self, sol: &AllocSolution, stage: usize) -> Profile {
        self.profiles.profile(&sol.graphs[stage], sol.repl_num(stage), sol.pipeline_num, sol.checkpointing)
    }

    fn stage_comm(&self, sg: &Composite, dev_num: usize, pipeline_num: usize) -> f64 {
        let split = (dev_num * pipeline_num) as f64;
        self.comm.comm_time(sg.input_size as f64 / split) + self.comm.comm_time(sg.output_size as f64 / split)
    }

    /// Estimated time of one training step: the pipeline fill, steady and drain steps, each bound
    /// by its slowest active stage, plus the slowest gradient all-reduce.
    pub fn estimate_time(&self, sol: &AllocSolution) -> f64 {
        let stage_num = sol.stage_num();
        let pipeline_num = sol.pipeline_num;
        if stage_num == 0 {
            return f64::INFINITY
        }

        let stage_times: Vec<_> = (0..stage_num).map(|i| {
            let prof = self.stage_profile(sol, i);
            let comm = self.stage_comm(&sol.graphs[i], sol.repl_num(i), pipeline_num);
            (prof.fwd_time + comm, prof.bwd_time + comm)
        }).collect();

        let mut comp_time = 0.;
        for step in 0..pipeline_num + stage_num - 1 {
            let g_from = (step + 1).saturating_sub(pipeline_num);
            let g_to = (step + 1).min(stage_num);

            let max_fwd = stage_times[g_from..g_to].iter().map(|t| t.0).fold(0., f64::max);
            let max_bwd = stage_times[g_from..g_to].iter().map(|t| t.1).fold(0., f64::max);
            comp_time += max_fwd + max_bwd;
        }

        let max_ar = sol.graphs.iter().map(|sg| self.comm.all_reduce_time(sg.param_size)).fold(0., f64::max);
        comp_time + max_ar
    }

    fn log_solution(&self, sol: &AllocSolution, time: f64) {
        info!("successfully found a feasible allocation: {} stages, pipeline_num={}, checkpointing={}, estimated time={}",
            sol.stage_num(), sol.pipeline_num, sol.checkpointing, time);
        for (i, sg) in sol.graphs.iter().enumerate() {
            let prof = self.stage_profile(sol, i);
            info!(" stage {i} {}: nodes {}..{} repl={} fwd={} bwd={} mem={} params={}",
                sg.id, sol.boundaries[i], sol.boundaries[i + 1], sol.repl_num(i), prof.fwd_time, prof.bwd_time, prof.max_allocated_mem, sg.param_size);
        }
    }

    /// Profiles of every single node over all device counts and the searched pipeline counts.
    pub fn node_profiles(&self) -> NodeProfileReport {
        let config = &self.config;
        let mut node_profiles = vec![];

        for (i, node) in self.graph.nodes.iter().enumerate() {
            let composite = self.merge_cache.node(i);
            let mut profiles = vec![];

            for pipeline_num in config.pipeline_nums() {
                for dev_num in 1..=config.total_device_count {
                    let checkpointing = pipeline_num > 1;
                    let prof = self.profiles.profile(composite, dev_num, pipeline_num, checkpointing);
                    profiles.push(ProfileSample {
                        global_batch_size: config.batch_size,
                        prof_batch_size: config.batch_size.div_ceil(dev_num * pipeline_num),
                        dev_num, pipeline_num, checkpointing,
                        fwd_time: prof.fwd_time,
                        bwd_time: prof.bwd_time,
                        max_allocated_mem: prof.max_allocated_mem,
                    })
                }
            }

            node_profiles.push(NodeProfileEntry {
                index: i,
                name: node.name.clone(),
                param_size: self.graph.param_size(NodeIndex(i)),
                input_size: self.graph.input_size(NodeIndex(i)),
                output_size: self.graph.output_size(NodeIndex(i)),
                profiles
            })
        }

        NodeProfileReport { total_dev_num: config.total_device_count, node_profiles }
    }

    pub fn dump_node_profiles(&self, path: &Path) -> Result<(), SearchError> {
        let report = self.node_profiles();
        info!("saving node profiles to {}", path.display());
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).map_err(SearchError::io(path))
    }
}
