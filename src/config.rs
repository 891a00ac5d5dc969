//! Search configuration, loadable from TOML.
//!
//! ```toml
//! batch_size = 256
//! total_device_count = 16
//! devices_per_node = 8
//! per_device_memory_limit = 17179869184
//! max_pipeline_num = 32
//!
//! [cluster]
//! device_flops = 1.2e14
//! bandwidth = 1.0e10
//! all_reduce_bandwidth = 5.0e9
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SearchError;
use crate::profiler::{BandwidthProfiler, FlopsProfiler};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub batch_size: usize,
    pub total_device_count: usize,
    /// devices on one host; device groups are made of whole hosts. `None` means a single host.
    pub devices_per_node: Option<usize>,
    pub per_device_memory_limit: u64,

    pub min_pipeline_num: usize,
    pub max_pipeline_num: usize,
    pub min_pipeline_batch_size: usize,
    pub limit_device_count_to_powers_of_two: bool,
    pub limit_device_count_by_batch_size: bool,

    // debugging overrides, 0 means unset
    pub forced_stage_num: usize,
    pub forced_pipeline_num: usize,

    /// keep sweeping larger device groups after a solution is found
    pub exhaustive_search: bool,
    /// profile a range as the sum of its nodes instead of the merged composite
    pub profile_by_accumulation: bool,

    pub load_alloc_solutions: bool,
    pub save_alloc_solutions: bool,
    pub alloc_solutions_file_prefix: String,
    pub dump_node_profiles: Option<PathBuf>,

    /// analytic cost model used by the command-line driver
    pub cluster: ClusterConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    #[serde(flatten)]
    pub computation: FlopsProfiler,
    #[serde(flatten)]
    pub communication: BandwidthProfiler,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            batch_size: 32,
            total_device_count: 1,
            devices_per_node: None,
            per_device_memory_limit: 16 << 30,
            min_pipeline_num: 1,
            max_pipeline_num: 32,
            min_pipeline_batch_size: 1,
            limit_device_count_to_powers_of_two: true,
            limit_device_count_by_batch_size: true,
            forced_stage_num: 0,
            forced_pipeline_num: 0,
            exhaustive_search: false,
            profile_by_accumulation: false,
            load_alloc_solutions: false,
            save_alloc_solutions: false,
            alloc_solutions_file_prefix: "alloc_solution".to_string(),
            dump_node_profiles: None,
            cluster: ClusterConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn from_file(path: &Path) -> Result<SearchConfig, SearchError> {
        let content = std::fs::read_to_string(path).map_err(SearchError::io(path))?;
        SearchConfig::from_toml(&content)
    }

    pub fn from_toml(s: &str) -> Result<SearchConfig, SearchError> {
        Ok(toml::from_str(s)?)
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        let invalid = |msg: String| Err(SearchError::InvalidConfig(msg));

        if self.batch_size == 0 {
            return invalid("batch_size must be positive".into())
        }
        if self.total_device_count == 0 {
            return invalid("total_device_count must be positive".into())
        }
        if let Some(d) = self.devices_per_node {
            if d == 0 || d > self.total_device_count {
                return invalid(format!("devices_per_node {d} must be in 1..={}", self.total_device_count))
            }
        }
        if self.forced_pipeline_num == 0 && self.min_pipeline_num > self.max_pipeline_num {
            return invalid(format!("min_pipeline_num {} exceeds max_pipeline_num {}", self.min_pipeline_num, self.max_pipeline_num))
        }
        if self.load_alloc_solutions && self.save_alloc_solutions {
            return invalid("load_alloc_solutions and save_alloc_solutions are exclusive".into())
        }
        Ok(())
    }

    /// Devices per host, clamped to the total.
    pub fn dev_per_node(&self) -> usize {
        self.devices_per_node.unwrap_or(self.total_device_count).min(self.total_device_count)
    }

    /// The inclusive pipeline count range after applying the forced override.
    pub fn pipeline_range(&self) -> (usize, usize) {
        if self.forced_pipeline_num != 0 {
            (self.forced_pipeline_num, self.forced_pipeline_num)
        } else {
            (self.min_pipeline_num, self.max_pipeline_num)
        }
    }

    /// Powers of two in the pipeline range, bounded by the batch size.
    pub fn pipeline_nums(&self) -> impl Iterator<Item=usize> {
        let (min, max) = self.pipeline_range();
        let limit = self.batch_size.min(max);
        std::iter::successors(Some(min.max(1)), |p| p.checked_mul(2)).take_while(move |&p| p <= limit)
    }
}
