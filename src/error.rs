use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::link::LinkError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("{got} ports supplied for {expected} configured")]
    PortCount { expected: usize, got: usize },
    #[error("port {got:?} supplied where {expected:?} was configured")]
    PortName { expected: String, got: String },
    #[error("{ports} ports need exactly {required} cores, {got} given")]
    CoreCount {
        ports: usize,
        required: usize,
        got: usize,
    },
    #[error("cannot pin {stage} to core {core}: {source}")]
    Affinity {
        stage: String,
        core: usize,
        source: io::Error,
    },
    #[error("cannot spawn thread {name}: {source}")]
    Spawn { name: String, source: io::Error },
    #[error("stage thread {0} panicked")]
    StagePanicked(String),
}
