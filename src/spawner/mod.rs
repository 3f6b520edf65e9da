//! Spawner (C5): produces new Process instances on demand (§4.4).
//!
//! Two real strategies plus a test double, dispatched through an enum
//! rather than an async trait object -- this crate does not depend on
//! `async-trait` (see `DESIGN.md`), and a Group only ever needs exactly
//! one spawner for its whole lifetime, so static dispatch costs nothing.

pub mod direct;
pub mod dummy;
pub mod handshake;
pub mod smart;

use crate::options::{Options, SpawnMethod};
use crate::pool::process::Process;
use crate::types::{GroupKey, SpawnError};
use dummy::SharedDummyConfig;

pub enum Spawner {
    Direct,
    Smart(smart::SmartSpawner),
    Dummy(SharedDummyConfig),
}

impl Spawner {
    pub fn for_method(method: SpawnMethod, dummy_config: Option<SharedDummyConfig>) -> Self {
        match method {
            SpawnMethod::Direct => Spawner::Direct,
            SpawnMethod::Smart => Spawner::Smart(smart::SmartSpawner::new()),
            SpawnMethod::Dummy => Spawner::Dummy(
                dummy_config.unwrap_or_else(|| {
                    std::sync::Arc::new(std::sync::Mutex::new(dummy::DummyConfig::default()))
                }),
            ),
        }
    }

    pub async fn spawn(
        &mut self,
        group_key: &GroupKey,
        options: &Options,
    ) -> Result<Process, SpawnError> {
        match self {
            Spawner::Direct => direct::spawn(group_key, options).await,
            Spawner::Smart(spawner) => spawner.spawn(group_key, options).await,
            Spawner::Dummy(config) => dummy::spawn(group_key, options, config.clone()).await,
        }
    }

    /// §4.4.2 step 4, a no-op for the other two strategies.
    pub async fn gc_idle_preloader(&mut self, max_idle: std::time::Duration) {
        if let Spawner::Smart(spawner) = self {
            spawner.shutdown_if_idle(max_idle).await;
        }
    }
}
