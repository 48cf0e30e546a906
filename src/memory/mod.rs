//! Three-tier conversational memory.
//!
//! - **STM** — a per-conversation hash of recent messages, gateway
//!   summary and key facts, mutated only through version-CAS writes;
//! - **MTM** — a relational summary store behind a cache-aside read path;
//! - **Gateway** — token-budget-triggered LLM compression that rewrites
//!   the STM summary and key facts.
//!
//! The [`MemoryCoordinator`] orchestrates all three around each LLM
//! invocation. Memory failures degrade silently: recall returns whatever
//! could be fetched and memorize never fails the calling node.

pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod lock;
pub mod mtm;
pub mod stm;
pub mod stm_redis;
pub mod tokens;

pub mod mtm_postgres;

pub use config::{GatewayConfig, MemoryConfig, MidTermConfig, ShortTermConfig, SummaryModelConfig};
pub use coordinator::{MemorizeRequest, MemoryCoordinator, RecallResult};
pub use gateway::{CompressResult, GatewayCompressor};
pub use lock::{CompressionLock, InMemoryCompressLock, RedisCompressLock};
pub use mtm::{
    CachedMtm, ConversationSummary, InMemoryMtmStore, InMemorySummaryCache, LlmSummaryGenerator,
    MidTermMemory, RedisSummaryCache, SummaryCache, SummaryGenerator,
};
pub use mtm_postgres::PostgresMtmStore;
pub use stm::{InMemoryStm, ShortTermMemory, StmState};
pub use stm_redis::RedisStm;
pub use tokens::{SimpleTokenEstimator, TokenEstimator};

use miette::Diagnostic;
use thiserror::Error;

/// Errors of the memory subsystem.
#[derive(Debug, Error, Diagnostic)]
pub enum MemoryError {
    /// CAS sentinel: the STM version moved under us.
    #[error("stm version conflict")]
    #[diagnostic(
        code(flowweave::memory::version_conflict),
        help("Another writer updated the conversation; reload and retry.")
    )]
    VersionConflict,

    #[error("mid_term memory requires short_term memory to be enabled")]
    #[diagnostic(code(flowweave::memory::mid_term_requires_short_term))]
    MidTermRequiresShortTerm,

    #[error("long_term memory requires mid_term memory to be enabled")]
    #[diagnostic(code(flowweave::memory::long_term_requires_mid_term))]
    LongTermRequiresMidTerm,

    #[error("conversation_id is required when memory is enabled")]
    #[diagnostic(code(flowweave::memory::conversation_id_required))]
    ConversationIdRequired,

    /// Backend (Redis/Postgres) failure, carried as text so the trait
    /// objects stay backend-agnostic.
    #[error("memory store error: {0}")]
    #[diagnostic(code(flowweave::memory::store))]
    Store(String),

    #[error("memory serialization error: {0}")]
    #[diagnostic(code(flowweave::memory::serde))]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(code(flowweave::memory::provider))]
    Provider(#[from] crate::provider::ProviderError),
}
