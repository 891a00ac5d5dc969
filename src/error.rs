use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Every (device group, stage count, pipeline count) configuration came back without a solution.
    #[error("no feasible allocation found")]
    NoFeasibleAllocation,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("cannot access {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("solution codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SearchError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> SearchError {
        let path = path.into();
        move |source| SearchError::Io { path, source }
    }
}
