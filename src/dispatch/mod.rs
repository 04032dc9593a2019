//! Chunked fan-out of inspection work to worker subprocesses.
//!
//! The item list is split into fixed-capacity chunks and every chunk is handed
//! to its own worker process at once. Each worker reports back over a private
//! JSON-lines channel; one aggregation loop turns reports and process exits
//! into records.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────┐
//!                  │      Supervisor      │
//!                  │  partition + launch  │
//!                  └──────────┬───────────┘
//!                             │ assign (stdin, once)
//!               ┌─────────────┼─────────────┐
//!               │             │             │
//!         ┌─────▼─────┐ ┌─────▼─────┐ ┌─────▼─────┐
//!         │ Worker 0  │ │ Worker 1  │ │ Worker N  │
//!         │ (process) │ │ (process) │ │ (process) │
//!         └─────┬─────┘ └─────┬─────┘ └─────┬─────┘
//!               │ reports (stdout) + exit   │
//!               └─────────────┼─────────────┘
//!                             │ WorkerEvent (mpsc)
//!                  ┌──────────▼───────────┐
//!                  │      Aggregator      │──▶ RecordSink
//!                  └──────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Disjoint chunks**: every item is assigned to exactly one worker
//! - **One writer**: only the aggregator writes records, one line at a time
//! - **Per-worker order**: item reports, then the chunk summary, then the exit
//! - **Bounded waiting**: a worker past its deadline or an inherited pipe never stalls the run

mod aggregator;
mod ipc;
mod partition;
mod proc;
mod protocol;
mod record;
mod signals;
mod spawn;
mod supervisor;
pub mod worker_main;

pub use partition::{ChunkPlan, DEFAULT_CHUNK_CAPACITY, partition};
pub use protocol::WorkItem;
pub use record::{LineSink, RecordFormat};
pub use spawn::{InspectCommand, WorkerProgram};
pub use supervisor::{DispatchConfig, Supervisor};
pub use worker_main::run_worker_main;
