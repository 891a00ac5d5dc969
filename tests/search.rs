//! End-to-end searches through the public API.

use dpstage::{
    AllocSolution, BandwidthProfiler, Composite, CostOracle, DpStaging, FileSolutionStore, FlopsProfiler, Graph, Profile,
    SearchConfig, SearchError, SolutionKey,
};

// ── Helpers ────────────────────────────────────────────────────

// fwd = params / devices, bwd = 2 * fwd, memory = params
fn by_params(g: &Composite, dev_num: usize, _: usize, _: bool) -> Profile {
    let fwd = g.param_size as f64 / dev_num as f64;
    Profile { fwd_time: fwd, bwd_time: 2. * fwd, max_allocated_mem: g.param_size }
}

fn three_nodes() -> Graph {
    Graph::chain(&[(1, 10, 4); 3])
}

fn base_config() -> SearchConfig {
    SearchConfig {
        batch_size: 8,
        total_device_count: 4,
        min_pipeline_num: 1,
        max_pipeline_num: 1,
        per_device_memory_limit: u64::MAX,
        ..Default::default()
    }
}

fn search(graph: &Graph, config: &SearchConfig, oracle: &dyn CostOracle) -> Result<AllocSolution, SearchError> {
    let comm = BandwidthProfiler::free();
    let result = DpStaging::new(graph, config, oracle, &comm).run();
    result
}

fn assert_partitions(sol: &AllocSolution, n_nodes: usize) {
    assert_eq!(sol.boundaries.first(), Some(&0));
    assert_eq!(sol.boundaries.last(), Some(&n_nodes));
    assert!(sol.boundaries.windows(2).all(|w| w[0] < w[1]), "{:?}", sol.boundaries);
    assert!(sol.dev_nums.windows(2).all(|w| w[0] < w[1]), "{:?}", sol.dev_nums);
    assert_eq!(sol.boundaries.len(), sol.stage_num() + 1);
    assert_eq!(sol.dev_nums.len(), sol.stage_num() + 1);
    for (i, sg) in sol.graphs.iter().enumerate() {
        assert_eq!((sg.key.from, sg.key.to + 1), (sol.boundaries[i], sol.boundaries[i + 1]));
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[test]
fn three_equal_nodes_on_four_devices() {
    let g = three_nodes();
    let config = base_config();
    let comm = BandwidthProfiler::free();
    let mut staging = DpStaging::new(&g, &config, &by_params, &comm);
    let sol = staging.run().unwrap();

    assert_partitions(&sol, 3);
    assert_eq!(sol.total_devices(), 4);
    // all three nodes on all four devices: fwd 7.5, bwd 15
    assert!(staging.estimate_time(&sol) <= 22.5);
    assert!(staging.profiles().hits() > 0);
}

#[test]
fn memory_limit_below_any_node_fails() {
    let g = three_nodes();
    let config = SearchConfig { per_device_memory_limit: 5, ..base_config() };
    assert!(matches!(search(&g, &config, &by_params), Err(SearchError::NoFeasibleAllocation)));
}

#[test]
fn memory_limit_forces_more_stages() {
    let g = Graph::chain(&[(1_000, 100, 8); 4]);
    let oracle = FlopsProfiler { device_flops: 1e3, ..Default::default() };
    // two nodes take 800 bytes of parameter state, three take 1200
    let config = SearchConfig { per_device_memory_limit: 900, ..base_config() };
    let sol = search(&g, &config, &oracle).unwrap();

    assert_partitions(&sol, 4);
    assert!(sol.stage_num() >= 2);
    for (i, sg) in sol.graphs.iter().enumerate() {
        assert!(sol.boundaries[i + 1] - sol.boundaries[i] <= 2);
        let prof = oracle.profile(sg, sol.repl_num(i), sol.pipeline_num, sol.checkpointing);
        assert!(prof.max_allocated_mem <= 900);
    }
}

#[test]
fn forced_stage_and_pipeline() {
    let g = Graph::chain(&[(1, 10, 4); 4]);
    let config = SearchConfig { forced_stage_num: 2, forced_pipeline_num: 2, ..base_config() };
    let sol = search(&g, &config, &by_params).unwrap();

    assert_partitions(&sol, 4);
    assert_eq!(sol.stage_num(), 2);
    assert_eq!(sol.pipeline_num, 2);
    assert!(sol.checkpointing);
}

#[test]
fn hosts_form_device_groups() {
    let g = three_nodes();
    let config = SearchConfig { total_device_count: 8, devices_per_node: Some(2), ..base_config() };
    let sol = search(&g, &config, &by_params).unwrap();

    assert_partitions(&sol, 3);
    // a single host already fits, so the pipeline is replicated on all four hosts
    assert!(sol.dev_nums.last().is_some_and(|&d| d <= 2));
    assert_eq!(sol.total_devices() % 4, 0);

    let exhaustive = SearchConfig { exhaustive_search: true, ..config };
    let sol = search(&g, &exhaustive, &by_params).unwrap();
    assert_partitions(&sol, 3);
}

#[test]
fn saved_solutions_are_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("alloc").to_string_lossy().into_owned();
    let g = three_nodes();

    let save = SearchConfig { save_alloc_solutions: true, alloc_solutions_file_prefix: prefix.clone(), ..base_config() };
    let saved = search(&g, &save, &by_params).unwrap();
    let key = SolutionKey { stage_num: 1, dev_num_per_group: 4, pipeline_num: 1 };
    assert!(FileSolutionStore::new(prefix.clone()).file_name(key).exists());

    let load = SearchConfig { load_alloc_solutions: true, save_alloc_solutions: false, ..save };
    let loaded = search(&g, &load, &by_params).unwrap();

    assert_eq!(loaded.boundaries, saved.boundaries);
    assert_eq!(loaded.dev_nums, saved.dev_nums);
    assert_eq!(loaded.repl_nums, saved.repl_nums);
}

#[test]
fn solutions_saved_for_another_graph_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("alloc").to_string_lossy().into_owned();

    let save = SearchConfig { save_alloc_solutions: true, alloc_solutions_file_prefix: prefix, ..base_config() };
    search(&three_nodes(), &save, &by_params).unwrap();

    // the same keys exist on disk, but their layouts end at node 3
    let load = SearchConfig { load_alloc_solutions: true, save_alloc_solutions: false, ..save };
    let four_nodes = Graph::chain(&[(1, 10, 4); 4]);
    assert!(matches!(search(&four_nodes, &load, &by_params), Err(SearchError::InvalidGraph(_))));
}

#[test]
fn missing_saved_solution_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = SearchConfig {
        load_alloc_solutions: true,
        alloc_solutions_file_prefix: dir.path().join("none").to_string_lossy().into_owned(),
        ..base_config()
    };
    assert!(matches!(search(&three_nodes(), &config, &by_params), Err(SearchError::Io { .. })));
}

#[test]
fn json_graph_with_analytic_model() {
    let g = Graph::from_json(r#"{
        "values": [
            {"name": "tokens", "size": 4096},
            {"name": "embed.weight", "size": 65536, "kind": "parameter"},
            {"name": "hidden", "size": 16384},
            {"name": "block.weight", "size": 262144, "kind": "parameter"},
            {"name": "block.out", "size": 16384},
            {"name": "head.weight", "size": 65536, "kind": "parameter"},
            {"name": "logits", "size": 8192}
        ],
        "nodes": [
            {"name": "embed", "inputs": [0], "outputs": [2], "params": [1], "flops": 1000000},
            {"name": "block", "inputs": [2], "outputs": [4], "params": [3], "flops": 8000000},
            {"name": "head", "inputs": [4], "outputs": [6], "params": [5], "flops": 2000000}
        ]
    }"#).unwrap();

    let config = SearchConfig { max_pipeline_num: 4, ..base_config() };
    let oracle = FlopsProfiler::default();
    let comm = BandwidthProfiler::default();
    let mut staging = DpStaging::new(&g, &config, &oracle, &comm);
    let sol = staging.run().unwrap();

    assert_partitions(&sol, 3);
    assert!(sol.total_devices() <= 4);
    assert!(staging.estimate_time(&sol).is_finite());
}
