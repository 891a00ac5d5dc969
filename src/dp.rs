use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};
use std::rc::Rc;

use float_ord::FloatOrd;
use tracing::{debug, enabled, trace, Level};

use crate::config::SearchConfig;
use crate::graph::Graph;
use crate::is_power_of_two;
use crate::merge::{Composite, CompositeIndex, MergeCache};
use crate::profiler::{CommunicationProfiler, Profile, ProfileCache};
use crate::solution::AllocSolution;

/// One `(stage_num, devices per group, pipeline_num)` configuration of the search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DpParams {
    pub stage_num: usize,
    pub dev_num_per_group: usize,
    pub replica_num: usize,
    pub pipeline_num: usize,
    pub checkpointing: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DpState {
    pub eval: f64,
    pub max_fwd: f64,
    pub max_bwd: f64,
    pub max_allreduce: f64,
    pub pre_boundary: usize,
    pub pre_dev_num: usize,
}

impl Default for DpState {
    fn default() -> Self {
        DpState { eval: f64::INFINITY, max_fwd: f64::INFINITY, max_bwd: f64::INFINITY, max_allreduce: f64::INFINITY, pre_boundary: 0, pre_dev_num: 0 }
    }
}

impl DpState {
    fn origin() -> DpState {
        DpState { eval: 0., max_fwd: 0., max_bwd: 0., max_allreduce: 0., pre_boundary: 0, pre_dev_num: 0 }
    }

    pub fn is_feasible(&self) -> bool {
        self.eval.is_finite()
    }

    // lower eval first; on ties fewer devices for the stage of cell `d`, then the earlier predecessor boundary
    fn rank(&self, d: usize) -> (FloatOrd<f64>, usize, usize) {
        (FloatOrd(self.eval), d - self.pre_dev_num, self.pre_boundary)
    }

    fn improves_on(&self, current: &DpState, d: usize) -> bool {
        self.is_feasible() && (!current.is_feasible() || self.rank(d) < current.rank(d))
    }
}

/// table[stage][boundary][used devices]
pub(crate) struct DpTable {
    layer_num: usize,
    dev_num: usize,
    states: Vec<DpState>,
}

impl DpTable {
    fn new(stage_num: usize, layer_num: usize, dev_num: usize) -> DpTable {
        let states = vec![DpState::default(); (stage_num + 1) * (layer_num + 1) * (dev_num + 1)];
        DpTable { layer_num, dev_num, states }
    }

    fn offset(&self, (s, b, d): (usize, usize, usize)) -> usize {
        debug_assert!(b <= self.layer_num && d <= self.dev_num);
        (s * (self.layer_num + 1) + b) * (self.dev_num + 1) + d
    }
}

impl Index<(usize, usize, usize)> for DpTable {
    type Output = DpState;

    fn index(&self, index: (usize, usize, usize)) -> &DpState {
        &self.states[self.offset(index)]
    }
}

impl IndexMut<(usize, usize, usize)> for DpTable {
    fn index_mut(&mut self, index: (usize, usize, usize)) -> &mut DpState {
        let i = self.offset(index);
        &mut self.states[i]
    }
}

/// The value of a cell when its last stage has `step_prof` and pays `step_comm` for moving its
/// inputs and outputs: the slowest forward plus the slowest backward seen so far.
pub fn estimate_eval(step_prof: &Profile, step_comm: f64, prev_max_fwd: f64, prev_max_bwd: f64) -> f64 {
    let max_fwd_val = (step_prof.fwd_time + step_comm).max(prev_max_fwd);
    let max_bwd_val = (step_prof.bwd_time + step_comm).max(prev_max_bwd);
    max_fwd_val + max_bwd_val
}

/// The allocation dynamic program for one configuration.
pub struct AllocDp<'s, 'a> {
    pub graph: &'a Graph,
    pub config: &'s SearchConfig,
    pub merge_cache: &'s mut MergeCache<'a>,
    pub profiles: &'s ProfileCache<'a>,
    pub comm: &'s dyn CommunicationProfiler,
}

impl<'s, 'a> AllocDp<'s, 'a> {
    /// The best stage layout for `p`, or `None` when nothing fits.
    pub fn solve(&mut self, p: DpParams) -> Option<AllocSolution> {
        let table = self.fill_table(p);
        self.backtrace(&table, p)
    }

    /// Profile of the nodes `b_prev..b` placed on `dev_num` devices.
    fn profile_step(&mut self, b_prev: usize, b: usize, dev_num: usize, p: DpParams) -> (CompositeIndex, Profile) {
        let step_graph = self.merge_cache.merge(b_prev, b - 1);
        let profile = if self.config.profile_by_accumulation {
            (b_prev..b).map(|i| self.profiles.profile(self.merge_cache.node(i), dev_num, p.pipeline_num, p.checkpointing))
                .fold(Profile::default(), |acc, x| acc + x)
        } else {
            self.profiles.profile(&self.merge_cache[step_graph], dev_num, p.pipeline_num, p.checkpointing)
        };
        (step_graph, profile)
    }

    pub(crate) fn fill_table(&mut self, p: DpParams) -> DpTable {
        let DpParams { stage_num, dev_num_per_group, replica_num, pipeline_num, checkpointing } = p;
        let layer_num = self.graph.n_nodes();
        assert!(0 < stage_num && stage_num <= layer_num, "stage_num {stage_num} must be in 1..={layer_num}");

        let mut table = DpTable::new(stage_num, layer_num, dev_num_per_group);
        for l in 0..=layer_num {
            for d in 0..=dev_num_per_group {
                table[(0, l, d)] = DpState::origin();
            }
        }

        let stage_bs = self.config.batch_size as f64 / (replica_num * pipeline_num) as f64;
        let max_d = stage_bs.ceil() as usize;

        for s in 1..=stage_num {
            trace!("stage_num={stage_num} s={s} dev_num_per_group={dev_num_per_group} pipeline_num={pipeline_num} checkpointing={checkpointing}");

            let mut min_d = 1;

            // the last stage must end at the last node
            let b_start = if s == stage_num { layer_num } else { s };
            for b in b_start..=layer_num - stage_num + s {
                let mut d = dev_num_per_group;
                while d >= min_d.max(s) {
                    let mut found_d_sol = false;
                    let mut skip_small_bs = false;

                    // the first stage starts from nothing
                    let (b_prev_limit, d_prev_limit) = if s == 1 { (1, 1) } else { (b, d) };

                    for b_prev in s-1..b_prev_limit {
                        for d_prev in s-1..d_prev_limit {
                            let stage_dev = d - d_prev;

                            if self.config.limit_device_count_by_batch_size && max_d < stage_dev {
                                trace!("skip dev_num: s={s} b={b} d={d} b_prev={b_prev} d_prev={d_prev} max_d={max_d}");
                                skip_small_bs = true;
                                continue
                            }

                            if self.config.limit_device_count_to_powers_of_two && !is_power_of_two(stage_dev) {
                                trace!("skip pot: s={s} b={b} d={d} b_prev={b_prev} d_prev={d_prev}");
                                skip_small_bs = true;
                                continue
                            }

                            let repl_bs = (stage_bs / stage_dev as f64).ceil() as usize;
                            if repl_bs < self.config.min_pipeline_batch_size {
                                trace!("skip small batch: s={s} b={b} d={d} b_prev={b_prev} d_prev={d_prev} repl_bs={repl_bs}");
                                skip_small_bs = true;
                                continue
                            }

                            let prev = table[(s - 1, b_prev, d_prev)];
                            if !prev.is_feasible() {
                                trace!("infeasible predecessor: s={s} b={b} d={d} b_prev={b_prev} d_prev={d_prev}");
                                continue
                            }

                            let (step_graph, step_prof) = self.profile_step(b_prev, b, stage_dev * replica_num, p);
                            let (step_comm, ar_comm) = self.step_comm(&self.merge_cache[step_graph], stage_dev, p);
                            let step_val = estimate_eval(&step_prof, step_comm, prev.max_fwd, prev.max_bwd);

                            if step_prof.max_allocated_mem > self.config.per_device_memory_limit {
                                // a larger d_prev leaves even fewer devices for this stage
                                trace!("memory exceeded: s={s} b={b} d={d} b_prev={b_prev} d_prev={d_prev} mem={}", step_prof.max_allocated_mem);
                                break
                            }

                            found_d_sol = true;

                            let candidate = DpState {
                                eval: step_val.max(prev.eval),
                                max_fwd: step_prof.fwd_time.max(prev.max_fwd),
                                max_bwd: step_prof.bwd_time.max(prev.max_bwd),
                                max_allreduce: ar_comm.max(prev.max_allreduce),
                                pre_boundary: b_prev,
                                pre_dev_num: d_prev,
                            };

                            if candidate.improves_on(&table[(s, b, d)], d) {
                                trace!("updated: s={s} b={b} d={d} b_prev={b_prev} d_prev={d_prev} step_val={step_val} eval={}", candidate.eval);
                                table[(s, b, d)] = candidate;
                            } else {
                                trace!("not updated: s={s} b={b} d={d} b_prev={b_prev} d_prev={d_prev} step_val={step_val} eval={}", table[(s, b, d)].eval);
                            }
                        }
                    }

                    if !found_d_sol && !skip_small_bs {
                        // fewer devices cannot help either
                        trace!("no solution with d={d}, stage {s} needs more devices");
                        min_d = d + 1;
                        break
                    }
                    d -= 1;
                }
            }
        }

        if enabled!(Level::TRACE) {
            self.log_table(&table, p);
        }

        table
    }

    /// Inter-stage transfer time of the inputs and outputs, and the gradient all-reduce time.
    fn step_comm(&self, step_graph: &Composite, stage_dev: usize, p: DpParams) -> (f64, f64) {
        let split = (stage_dev * p.replica_num * p.pipeline_num) as f64;
        let in_comm = self.comm.comm_time(step_graph.input_size as f64 / split);
        let out_comm = self.comm.comm_time(step_graph.output_size as f64 / split);
        (in_comm + out_comm, self.comm.all_reduce_time(step_graph.param_size))
    }

    fn log_table(&self, table: &DpTable, p: DpParams) {
        let layer_num = self.graph.n_nodes();
        trace!("DP summary (dev_num_per_group={} pipeline_num={})", p.dev_num_per_group, p.pipeline_num);
        for s in 1..=p.stage_num {
            trace!("DP table: stage {s}/{}", p.stage_num);
            let b_start = if s == p.stage_num { layer_num } else { s };
            for b in b_start..=layer_num - p.stage_num + s {
                let evals: Vec<_> = (0..=p.dev_num_per_group).map(|d| table[(s, b, d)].eval).collect();
                trace!(" v[{s}][{b}]={evals:?}");
            }
        }
    }

    pub(crate) fn backtrace(&mut self, table: &DpTable, p: DpParams) -> Option<AllocSolution> {
        let layer_num = self.graph.n_nodes();

        // prefer using the whole group on ties
        let mut best_d = None;
        for d in (0..=p.dev_num_per_group).rev() {
            let state = &table[(p.stage_num, layer_num, d)];
            if state.is_feasible() && best_d.map(|b| state.eval < table[(p.stage_num, layer_num, b)].eval).unwrap_or(true) {
                best_d = Some(d)
            }
        }

        let Some(best_d) = best_d else {
            debug!("no solution for {p:?}");
            return None
        };

        let mut b_sol = layer_num;
        let mut d_sol = best_d;
        let mut boundaries = vec![b_sol];
        let mut dev_nums = vec![d_sol];
        let mut graphs = vec![];
        let mut repl_nums = BTreeMap::new();
        let mut part_info = BTreeMap::new();

        for s in (1..=p.stage_num).rev() {
            let state = table[(s, b_sol, d_sol)];
            if !state.is_feasible() {
                return None
            }

            let step_graph = self.merge_cache.merge(state.pre_boundary, b_sol - 1);
            let sg: Rc<Composite> = self.merge_cache[step_graph].clone();
            repl_nums.insert(sg.id.clone(), (d_sol - state.pre_dev_num) * p.replica_num);
            part_info.insert(sg.id.clone(), sg.clone());
            graphs.push(sg);

            b_sol = state.pre_boundary;
            d_sol = state.pre_dev_num;
            boundaries.push(b_sol);
            dev_nums.push(d_sol);
        }

        graphs.reverse();
        boundaries.reverse();
        dev_nums.reverse();

        debug!("solution for {p:?}: eval={} boundaries={boundaries:?} dev_nums={dev_nums:?}", table[(p.stage_num, layer_num, best_d)].eval);

        Some(AllocSolution {
            graphs, repl_nums, part_info,
            pipeline_num: p.pipeline_num,
            checkpointing: p.checkpointing,
            boundaries, dev_nums
        })
    }
}
