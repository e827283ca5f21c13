//! FairShare-Core: Shared Errors

use crate::resource::ResourceType;

/// Pool mutation errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("insufficient {resource}: requested {requested}, available {available}")]
    InsufficientAvailable {
        resource: ResourceType,
        requested: u64,
        available: u64,
    },

    #[error("releasing {resource} would exceed capacity: {restored} > total {total}")]
    ExceedsCapacity {
        resource: ResourceType,
        restored: u64,
        total: u64,
    },
}

/// Agent configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent {agent_id}: minimum {minimum} exceeds ideal {ideal} for {resource}")]
    InvalidDemand {
        agent_id: String,
        resource: ResourceType,
        minimum: u64,
        ideal: u64,
    },

    #[error("unknown agent id: {agent_id}")]
    UnknownAgent { agent_id: String },
}
