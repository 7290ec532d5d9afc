pub mod checkpoint;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod handlers;
pub mod merger;
pub mod metrics;
pub mod schema;
pub mod store;
pub mod sync_adapter;
pub mod telemetry;
pub mod types;
pub mod write_buffer;

#[cfg(test)]
mod executor_tests;

pub use checkpoint::{CheckpointFields, EventType, MAX_CHECKPOINT, ZERO_CHECKPOINT};
pub use client::{ReadonlyClient, RpcTransport};
pub use errors::{EngineError, EngineResult, ErrorKind};
pub use executor::{Engine, EngineParts, ExecutorConfig, Pipeline};
pub use handlers::{Context, EventHandler, HandlerRegistry};
pub use merger::{EventMerger, OrderingPolicy};
pub use schema::CompiledSchema;
pub use store::{IndexingMode, PostgresStore, StateStore, StoreTransaction};
pub use sync_adapter::{SourceUpdate, SyncSource};
pub use types::{ControlEvent, Event, EventData, RawBlock, RawBlockBundle, Source};
