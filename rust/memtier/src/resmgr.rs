// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The lifecycle-event surface the runtime shim drives. Every event
//! takes the process-wide policy lock for its whole duration, so the
//! policy core never sees concurrent decisions and callers observing
//! state (metrics, the event server) serialize through the same lock.

use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, ContainerSpec, Device, KeyValue, LinuxResources, Mount, PodSpec};
use crate::policy::Policy;

/// The full set of knobs handed back for a just-created container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerCreateUpdate {
    pub resources: LinuxResources,
    pub envs: Vec<KeyValue>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<Device>,
    pub labels: std::collections::BTreeMap<String, String>,
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// A resource update for an already-running peer container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub container_id: String,
    pub resources: LinuxResources,
}

/// The response to CreateContainer: the knobs for the new container
/// plus updates for peers whose shared CPU set changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateResponse {
    pub create: ContainerCreateUpdate,
    pub updates: Vec<ContainerUpdate>,
}

struct State {
    cache: Cache,
    policy: Policy,
}

/// The resource manager: the container cache and the policy behind one
/// lock.
pub struct ResourceManager {
    state: Mutex<State>,
}

impl ResourceManager {
    pub fn new(policy: Policy) -> Self {
        Self {
            state: Mutex::new(State {
                cache: Cache::new(),
                policy,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("policy lock poisoned")
    }

    /// Replay the grant snapshot. Called once, before any events.
    pub fn restore(&self) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.policy.restore(&mut state.cache)
    }

    pub fn run_pod_sandbox(&self, pod: PodSpec) {
        let mut guard = self.lock();
        let state = &mut *guard;
        info!("RunPodSandbox {}", pod.id);
        state.cache.insert_pod(pod);
    }

    pub fn stop_pod_sandbox(&self, id: &str) {
        info!("StopPodSandbox {}", id);
    }

    pub fn remove_pod_sandbox(&self, id: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        info!("RemovePodSandbox {}", id);
        state.cache.delete_pod(id);
    }

    /// Admit a container: place it, and return its knobs together with
    /// the pending updates of affected peers.
    pub fn create_container(&self, spec: ContainerSpec) -> Result<CreateResponse> {
        let mut guard = self.lock();
        let state = &mut *guard;
        info!("CreateContainer {}", spec.id);

        let id = state.cache.insert_container(spec)?;
        state
            .policy
            .allocate(&mut state.cache, &id)
            .context("failed to allocate resources")?;

        let create = pending_create(&mut state.cache, &id);
        let updates = pending_updates(&mut state.cache, Some(&id));

        Ok(CreateResponse { create, updates })
    }

    pub fn start_container(&self, id: &str) {
        info!("StartContainer {}", id);
    }

    pub fn update_container(&self, id: &str) -> Vec<ContainerUpdate> {
        let mut guard = self.lock();
        let state = &mut *guard;
        info!("UpdateContainer {}", id);
        pending_updates(&mut state.cache, None)
    }

    /// Stop a container: release its grant and return the updates of
    /// peers whose shared set grew back.
    pub fn stop_container(&self, id: &str) -> Result<Vec<ContainerUpdate>> {
        let mut guard = self.lock();
        let state = &mut *guard;
        info!("StopContainer {}", id);

        if state.cache.lookup_container(id).is_none() {
            return Ok(Vec::new());
        }
        state
            .policy
            .release(&mut state.cache, id)
            .context("failed to release resources")?;

        Ok(pending_updates(&mut state.cache, Some(id)))
    }

    pub fn remove_container(&self, id: &str) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        info!("RemoveContainer {}", id);

        // a stop may never have been delivered
        if let Err(e) = state.policy.release(&mut state.cache, id) {
            warn!("release on remove failed for {}: {:#}", id, e);
        }
        state.cache.delete_container(id);
        Ok(())
    }

    /// Re-seed the cache from the runtime's view of the world and drop
    /// grants of containers that no longer exist.
    pub fn synchronize(
        &self,
        pods: Vec<PodSpec>,
        containers: Vec<ContainerSpec>,
    ) -> Result<Vec<ContainerUpdate>> {
        let mut guard = self.lock();
        let state = &mut *guard;
        info!(
            "Synchronize: {} pods, {} containers",
            pods.len(),
            containers.len()
        );

        for pod in pods {
            state.cache.insert_pod(pod);
        }
        for container in containers {
            if let Err(e) = state.cache.insert_container(container) {
                warn!("skipping out-of-sync container: {:#}", e);
            }
        }

        state.policy.restore(&mut state.cache)?;
        Ok(pending_updates(&mut state.cache, None))
    }

    pub fn shutdown(&self) {
        info!("Shutdown");
    }

    /// Run a closure under the policy lock, e.g. to read consistent
    /// state for metrics.
    pub fn with_policy<T>(&self, f: impl FnOnce(&Policy, &Cache) -> T) -> T {
        let guard = self.lock();
        f(&guard.policy, &guard.cache)
    }
}

/// Collect the create-time knobs of a container and clear its pending
/// marks.
fn pending_create(cache: &mut Cache, id: &str) -> ContainerCreateUpdate {
    let container = match cache.container_mut(id) {
        Some(c) => c,
        None => return ContainerCreateUpdate::default(),
    };

    let update = ContainerCreateUpdate {
        resources: container.assign.clone(),
        envs: container.envs.clone(),
        mounts: container.mounts.clone(),
        devices: container.devices.clone(),
        labels: container.labels.clone(),
        annotations: container.annotations.clone(),
    };
    container.clear_pending();
    update
}

/// Collect updates for every container with pending changes, except the
/// one the current event is about, clearing their pending marks.
fn pending_updates(cache: &mut Cache, exclude: Option<&str>) -> Vec<ContainerUpdate> {
    let mut updates = Vec::new();
    for id in cache.pending_containers() {
        if exclude == Some(id.as_str()) {
            continue;
        }
        let container = match cache.container_mut(&id) {
            Some(c) => c,
            None => continue,
        };
        updates.push(ContainerUpdate {
            container_id: id.clone(),
            resources: container.assign.clone(),
        });
        container.clear_pending();
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResourceSpec;
    use crate::memory::MemType;
    use crate::policy::PolicyOptions;
    use crate::system::mock::MockSystem;

    fn manager() -> ResourceManager {
        let sys = MockSystem::new()
            .node(0, 0, "0-7", MemType::DRAM, 32 << 30)
            .node(1, 1, "8-15", MemType::DRAM, 32 << 30);
        let policy = Policy::new(Box::new(sys), PolicyOptions::default()).unwrap();
        ResourceManager::new(policy)
    }

    fn pod(id: &str) -> PodSpec {
        PodSpec {
            id: id.to_string(),
            name: id.to_string(),
            namespace: "default".into(),
            ..Default::default()
        }
    }

    fn shared_container(id: &str, pod_id: &str, milli: u64) -> ContainerSpec {
        ContainerSpec {
            id: id.to_string(),
            pod_id: pod_id.to_string(),
            name: id.to_string(),
            resources: ResourceSpec {
                cpu_request_milli: milli,
                cpu_limit_milli: 2 * milli,
                mem_request: 1 << 30,
                mem_limit: 1 << 30,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn create_and_stop_produce_updates() {
        let mgr = manager();
        mgr.run_pod_sandbox(pod("p0"));

        let response = mgr.create_container(shared_container("c0", "p0", 500)).unwrap();
        assert!(!response.create.resources.cpuset_cpus.is_empty());
        assert!(response.create.resources.cpu_shares >= 2);
        assert!(response.updates.is_empty());

        // a second shared container lands elsewhere; no overlap change
        // for c0 means no pending update for it
        let response = mgr.create_container(shared_container("c1", "p0", 500)).unwrap();
        for update in &response.updates {
            assert_ne!(update.container_id, "c1");
        }

        let updates = mgr.stop_container("c0").unwrap();
        for update in &updates {
            assert_ne!(update.container_id, "c0");
        }
        mgr.remove_container("c0").unwrap();

        mgr.with_policy(|policy, _| {
            assert!(policy.allocation("c0").is_none());
            assert!(policy.allocation("c1").is_some());
        });
    }

    #[test]
    fn stop_unknown_container_is_benign() {
        let mgr = manager();
        assert!(mgr.stop_container("nope").unwrap().is_empty());
    }
}
