//! # Apppool Core
//!
//! A standalone process pool: spawns application processes on demand and
//! hands out sessions against them, matching incoming requests to an
//! existing process when one is free and spawning a new one when it isn't.
//!
//! - Process lifecycle management (spawn, enable/disable, detach, reap)
//! - Per-Group spawn throttling with bounded retries and backoff
//! - Sticky-session-aware process selection
//! - Background GC for idle eviction and out-of-band work
//! - A minimal line-oriented control surface
//!
//! ## Architecture
//!
//! The pool follows a single-actor model where `PoolActor` owns all
//! mutable state:
//! ```text
//!                    ┌─────────────────────────────────┐
//!   async_get() →    │          Pool Actor              │
//!                    │  ┌─────────┐ ┌─────────┐         │
//!                    │  │ Group A │ │ Group B │   ...   │
//!                    │  │ +Spawner│ │ +Spawner│         │
//!                    │  └─────────┘ └─────────┘         │
//!                    └─────────────────────────────────┘
//! ```

// This crate forks/execs application processes and drops privileges for
// them; that one operation genuinely needs `unsafe` (see spawner::direct).
#![warn(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod control;
pub mod options;
pub mod pool;
pub mod recovery;
pub mod spawner;
pub mod observability;
pub mod types;

pub use options::Options;
pub use pool::PoolHandle;
pub use types::{Config, PoolError, Result};
