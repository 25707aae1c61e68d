//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use friction_rig::config::RigConfig;
use friction_rig::hardware::SimulatedPort;
use friction_rig::persistence::MemoryTestStore;
use friction_rig::Rig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Initialized simulated rig with an in-memory store.
pub struct SimRig {
    pub rig: Rig,
    pub port: Arc<SimulatedPort>,
    pub store: Arc<MemoryTestStore>,
}

pub async fn sim_rig() -> SimRig {
    sim_rig_with(RigConfig::default()).await
}

pub async fn sim_rig_with(config: RigConfig) -> SimRig {
    let store = Arc::new(MemoryTestStore::new());
    let (rig, port) = Rig::simulated(config, store.clone());
    rig.initialize().await.unwrap();
    SimRig { rig, port, store }
}

/// Poll `condition` every 5 ms until it holds, failing after `limit`.
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(limit, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
