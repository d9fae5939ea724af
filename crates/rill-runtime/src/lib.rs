//! rill-runtime - the Rill language runtime core
//!
//! The runtime behind Rill's two unusual execution-model features: a
//! per-thread bump-allocating heap with note/collect semantics, and a
//! multi-version incremental memoization graph that caches function
//! results and invalidates them automatically when inputs change.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Process (one per running thread)                            │
//! │  ┌─────────────┐   ┌──────────────┐   ┌───────────────────┐  │
//! │  │  Obstack    │   │  Task queue  │   │  Memo context     │  │
//! │  │  note/      │   │  owned /     │   │  deps recorded    │  │
//! │  │  collect    │   │  orphaned /  │   │  per computation  │  │
//! │  └──────┬──────┘   │  sleeping /  │   └─────────┬─────────┘  │
//! │         │          │  dead        │             │            │
//! └─────────┼──────────┴──────────────┴─────────────┼────────────┘
//!           ▼                                       ▼
//! ┌───────────────────┐                 ┌────────────────────────┐
//! │  Arena + kind map │                 │  Memoization graph     │
//! │  obstack / iobj / │                 │  Invocation → Revision │
//! │  large / unknown  │                 │  traces, subscriptions │
//! └─────────┬─────────┘                 │  transactions, LRU,    │
//!           ▼                           │  cleanup lists         │
//! ┌───────────────────┐                 └───────────┬────────────┘
//! │  Interner         │◄────────────────────────────┘
//! │  canonical copies,│   (invocations, cached values and
//! │  cycle delegates  │    exceptions are interned objects)
//! └───────────────────┘
//! ```
//!
//! Steady state: user code runs on a [`process::Process`], allocates on
//! its [`obstack::Obstack`], and occasionally calls a memoized function,
//! which enters the invocation layer; the active context records
//! dependencies while the body runs; completed results are installed in
//! the invocation's revision list. A [`memo::Transaction`] mutates cells,
//! advancing the global timeline and pushing invalidations through the
//! inverse edges; the per-thread lock manager defers decrefs and
//! invalidation walks until no locks are held.
//!
//! ## Modules
//!
//! - [`arena`]: page-aligned address-range allocator and kind map
//! - [`object`]: tagged pointers, reference masks, type descriptors
//! - [`string`]: short strings in fake pointers, long-string objects
//! - [`obstack`]: the bump heap, handles, freeze, copying collector
//! - [`intern`]: concurrent canonicalization and cycle collapse
//! - [`memo`]: revisions, traces, invocations, cells, transactions,
//!   refresh, LRU, cleanup, persistence
//! - [`lock`]: per-thread lock bookkeeping and deferred work
//! - [`process`]: process container and lock-free task queue
//! - [`parallel`]: parallel tabulate over worker processes
//! - [`config`], [`error`]: tuning and error types

pub mod arena;
pub mod config;
pub mod error;
pub mod intern;
pub mod lock;
pub mod memo;
pub mod object;
pub mod obstack;
pub mod parallel;
pub mod process;
pub mod string;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use memo::{Cell, MemoValue, Transaction};
pub use obstack::{Handle, Obstack, Pos};
pub use process::{Process, ProcessRef};

/// Crate version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the runtime for the calling thread: validate the
/// configuration and install a permanent process (with its obstack) so
/// Rill code can run.
pub fn init(config: RuntimeConfig) -> Result<ProcessRef> {
    config.validate()?;
    let process = Process::make()?;
    Process::context_switch_to(Some(process.clone()));
    log::debug!("rill runtime initialized (version {})", VERSION);
    Ok(process)
}
