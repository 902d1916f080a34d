// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cache of pods and containers observed through the lifecycle events.
//! The cache keeps what the policy needs between events: declared
//! resources, annotations, tags, topology hints, and the pending cgroup
//! knobs enforcement has not picked up yet.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::affinity::Affinity;
use crate::memory::MemType;

/// Annotation namespace consumed by the policy.
pub const ANNOTATION_DOMAIN: &str = "memtier.io";

/// The namespace whose containers are always placed at the root pool.
pub const NAMESPACE_SYSTEM: &str = "kube-system";

/// Tag marking containers known to execute AVX512 code.
pub const TAG_AVX512: &str = "AVX512";

/// The controller name used for pending CPU/memory pinning updates.
pub const CPU_CONTROLLER: &str = "cpu";

/// A topology hint attached to a container by an external provider
/// (e.g. device locality). Each field is a range-list of ids; unused
/// dimensions stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyHint {
    #[serde(default)]
    pub cpus: String,
    #[serde(default)]
    pub numas: String,
    #[serde(default)]
    pub sockets: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub propagation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub container_path: String,
    pub host_path: String,
    #[serde(default)]
    pub permissions: String,
}

/// Declared container resources, already normalized to milli-CPUs and
/// bytes by the collaborator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu_request_milli: u64,
    #[serde(default)]
    pub cpu_limit_milli: u64,
    #[serde(default)]
    pub mem_request: u64,
    #[serde(default)]
    pub mem_limit: u64,
}

/// A pod as delivered by RunPodSandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: String,
    #[serde(default)]
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub runtime_handler: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// A container as delivered by CreateContainer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub id: String,
    pub pod_id: String,
    pub name: String,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub hints: BTreeMap<String, TopologyHint>,
    #[serde(default)]
    pub envs: Vec<KeyValue>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// The cgroup knobs assigned to a container by the policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxResources {
    #[serde(default)]
    pub cpuset_cpus: String,
    #[serde(default)]
    pub cpuset_mems: String,
    #[serde(default)]
    pub cpu_shares: i64,
    #[serde(default)]
    pub cpu_period: i64,
    #[serde(default)]
    pub cpu_quota: i64,
}

#[derive(Debug, Clone)]
pub struct Pod {
    pub id: String,
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub runtime_handler: String,
    pub annotations: BTreeMap<String, String>,
}

impl Pod {
    fn new(spec: PodSpec) -> Self {
        Self {
            id: spec.id,
            uid: spec.uid,
            name: spec.name,
            namespace: spec.namespace,
            runtime_handler: spec.runtime_handler,
            annotations: spec.annotations,
        }
    }

    /// Look up an annotation in our namespace, preferring the
    /// container-scoped form over the pod-scoped one.
    pub fn policy_annotation(&self, key: &str, container: &str) -> Option<&str> {
        self.annotations
            .get(&format!("{key}.{ANNOTATION_DOMAIN}/container.{container}"))
            .or_else(|| self.annotations.get(&format!("{key}.{ANNOTATION_DOMAIN}/pod")))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub pod_id: String,
    pub name: String,
    pub namespace: String,
    pub resources: ResourceSpec,
    pub annotations: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub hints: BTreeMap<String, TopologyHint>,
    pub affinities: Vec<Affinity>,
    pub envs: Vec<KeyValue>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<Device>,
    pub labels: BTreeMap<String, String>,
    pub assign: LinuxResources,
    pending: BTreeSet<String>,
}

impl Container {
    /// The stable key grants and snapshots are indexed by.
    pub fn cache_id(&self) -> &str {
        &self.id
    }

    pub fn pretty_name(&self) -> String {
        format!("{}/{}", self.pod_id, self.name)
    }

    pub fn get_tag(&self, tag: &str) -> Option<&str> {
        self.tags.get(tag).map(String::as_str)
    }

    /// Whether the pod guarantees its resources: requests equal limits
    /// and both are set, for CPU and memory alike.
    pub fn is_guaranteed(&self) -> bool {
        let r = &self.resources;
        r.cpu_limit_milli > 0
            && r.cpu_request_milli == r.cpu_limit_milli
            && r.mem_limit > 0
            && r.mem_request == r.mem_limit
    }

    /// Split the CPU ask into whole exclusive CPUs and a fractional
    /// milli-CPU share, and decide whether kernel-isolated CPUs are
    /// preferred. Guaranteed containers get their integral limit carved
    /// out as full CPUs; everything else runs purely in the shared pool.
    pub fn cpu_preferences(&self, pod: &Pod) -> (usize, usize, bool) {
        let (full, fraction) = if self.is_guaranteed() {
            let limit = self.resources.cpu_limit_milli as usize;
            (limit / 1000, limit % 1000)
        } else {
            (0, self.resources.cpu_request_milli as usize)
        };

        let isolate = full > 0
            && pod
                .policy_annotation("prefer-isolated-cpus", &self.name)
                .map(|v| v == "true")
                .unwrap_or(false);

        (full, fraction, isolate)
    }

    /// The memory request, limit and requested tier mask. An absent or
    /// unparseable memory-type annotation yields `UNSPEC`; the caller
    /// rewrites that to the configured default.
    pub fn memory_preferences(&self, pod: &Pod) -> (u64, u64, MemType) {
        let mem_type = pod
            .policy_annotation("memory-type", &self.name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(MemType::UNSPEC);

        let lim = if self.resources.mem_limit > 0 {
            self.resources.mem_limit
        } else {
            self.resources.mem_request
        };

        (self.resources.mem_request, lim, mem_type)
    }

    pub fn set_cpuset_cpus(&mut self, cpus: &str) {
        if self.assign.cpuset_cpus != cpus {
            self.assign.cpuset_cpus = cpus.to_string();
            self.mark_pending(CPU_CONTROLLER);
        }
    }

    pub fn set_cpuset_mems(&mut self, mems: &str) {
        if self.assign.cpuset_mems != mems {
            self.assign.cpuset_mems = mems.to_string();
            self.mark_pending(CPU_CONTROLLER);
        }
    }

    pub fn set_cpu_shares(&mut self, shares: i64) {
        if self.assign.cpu_shares != shares {
            self.assign.cpu_shares = shares;
            self.mark_pending(CPU_CONTROLLER);
        }
    }

    pub fn mark_pending(&mut self, controller: &str) {
        self.pending.insert(controller.to_string());
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

/// Convert a milli-CPU amount to cgroup cpu.shares, the way the kubelet
/// does it.
pub fn milli_cpu_to_shares(milli: usize) -> i64 {
    ((milli * 1024 / 1000).max(2)) as i64
}

/// Parse a `key=value,key=value` tag annotation.
fn parse_tags(s: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for item in s.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.split_once('=') {
            Some((k, v)) => tags.insert(k.to_string(), v.to_string()),
            None => tags.insert(item.to_string(), String::new()),
        };
    }
    tags
}

/// The pod/container cache.
#[derive(Default)]
pub struct Cache {
    pods: HashMap<String, Pod>,
    containers: HashMap<String, Container>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pod(&mut self, spec: PodSpec) -> &Pod {
        let pod = Pod::new(spec);
        let id = pod.id.clone();
        self.pods.insert(id.clone(), pod);
        &self.pods[&id]
    }

    pub fn delete_pod(&mut self, id: &str) {
        self.pods.remove(id);
        self.containers.retain(|_, c| c.pod_id != id);
    }

    pub fn lookup_pod(&self, id: &str) -> Option<&Pod> {
        self.pods.get(id)
    }

    /// Insert a container, deriving tags, affinities and the rest of the
    /// policy-visible attributes from its pod's annotations.
    pub fn insert_container(&mut self, spec: ContainerSpec) -> Result<String> {
        let pod = match self.pods.get(&spec.pod_id) {
            Some(pod) => pod,
            None => bail!("container {} references unknown pod {}", spec.id, spec.pod_id),
        };

        let tags = pod
            .annotations
            .get(&format!("tags.{ANNOTATION_DOMAIN}/container.{}", spec.name))
            .map(|v| parse_tags(v))
            .unwrap_or_default();

        let affinities = match pod
            .annotations
            .get(&format!("affinity.{ANNOTATION_DOMAIN}/container.{}", spec.name))
        {
            Some(v) => serde_json::from_str(v)
                .with_context(|| format!("invalid affinity annotation for {}", spec.name))?,
            None => Vec::new(),
        };

        let container = Container {
            id: spec.id.clone(),
            pod_id: spec.pod_id,
            name: spec.name,
            namespace: pod.namespace.clone(),
            resources: spec.resources,
            annotations: spec.annotations,
            tags,
            hints: spec.hints,
            affinities,
            envs: spec.envs,
            mounts: spec.mounts,
            devices: spec.devices,
            labels: spec.labels,
            assign: LinuxResources::default(),
            pending: BTreeSet::new(),
        };

        let id = spec.id;
        self.containers.insert(id.clone(), container);
        Ok(id)
    }

    pub fn delete_container(&mut self, id: &str) {
        self.containers.remove(id);
    }

    pub fn lookup_container(&self, id: &str) -> Option<&Container> {
        self.containers.get(id)
    }

    pub fn container_mut(&mut self, id: &str) -> Option<&mut Container> {
        self.containers.get_mut(id)
    }

    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    /// The pod a container belongs to.
    pub fn pod_of(&self, container: &Container) -> Option<&Pod> {
        self.pods.get(&container.pod_id)
    }

    /// Ids of containers with unenforced assignments, in stable order.
    pub fn pending_containers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .containers
            .values()
            .filter(|c| c.has_pending())
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with(annotations: &[(&str, &str)]) -> PodSpec {
        PodSpec {
            id: "pod0".into(),
            uid: "uid0".into(),
            name: "pod0".into(),
            namespace: "default".into(),
            runtime_handler: String::new(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn container(name: &str, resources: ResourceSpec) -> ContainerSpec {
        ContainerSpec {
            id: format!("c-{name}"),
            pod_id: "pod0".into(),
            name: name.into(),
            resources,
            ..Default::default()
        }
    }

    #[test]
    fn shares_conversion() {
        assert_eq!(milli_cpu_to_shares(0), 2);
        assert_eq!(milli_cpu_to_shares(1), 2);
        assert_eq!(milli_cpu_to_shares(500), 512);
        assert_eq!(milli_cpu_to_shares(1000), 1024);
        assert_eq!(milli_cpu_to_shares(2500), 2560);
    }

    #[test]
    fn guaranteed_cpu_preferences() {
        let mut cache = Cache::new();
        cache.insert_pod(pod_with(&[]));
        let id = cache
            .insert_container(container(
                "app",
                ResourceSpec {
                    cpu_request_milli: 2500,
                    cpu_limit_milli: 2500,
                    mem_request: 1 << 30,
                    mem_limit: 1 << 30,
                },
            ))
            .unwrap();

        let c = cache.lookup_container(&id).unwrap();
        let pod = cache.pod_of(c).unwrap();
        assert!(c.is_guaranteed());
        assert_eq!(c.cpu_preferences(pod), (2, 500, false));
    }

    #[test]
    fn burstable_cpu_preferences() {
        let mut cache = Cache::new();
        cache.insert_pod(pod_with(&[]));
        let id = cache
            .insert_container(container(
                "app",
                ResourceSpec {
                    cpu_request_milli: 250,
                    cpu_limit_milli: 1000,
                    mem_request: 1 << 30,
                    mem_limit: 2 << 30,
                },
            ))
            .unwrap();

        let c = cache.lookup_container(&id).unwrap();
        let pod = cache.pod_of(c).unwrap();
        assert!(!c.is_guaranteed());
        assert_eq!(c.cpu_preferences(pod), (0, 250, false));
    }

    #[test]
    fn annotations_drive_preferences() {
        let mut cache = Cache::new();
        cache.insert_pod(pod_with(&[
            ("memory-type.memtier.io/pod", "dram,pmem"),
            ("prefer-isolated-cpus.memtier.io/container.app", "true"),
            ("tags.memtier.io/container.app", "AVX512"),
        ]));
        let id = cache
            .insert_container(container(
                "app",
                ResourceSpec {
                    cpu_request_milli: 2000,
                    cpu_limit_milli: 2000,
                    mem_request: 1 << 30,
                    mem_limit: 1 << 30,
                },
            ))
            .unwrap();

        let c = cache.lookup_container(&id).unwrap();
        let pod = cache.pod_of(c).unwrap();
        assert_eq!(c.cpu_preferences(pod), (2, 0, true));
        let (_, lim, mem_type) = c.memory_preferences(pod);
        assert_eq!(lim, 1 << 30);
        assert_eq!(mem_type, MemType::DRAM | MemType::PMEM);
        assert!(c.get_tag(TAG_AVX512).is_some());
    }

    #[test]
    fn pending_tracking() {
        let mut cache = Cache::new();
        cache.insert_pod(pod_with(&[]));
        let id = cache
            .insert_container(container("app", ResourceSpec::default()))
            .unwrap();

        assert!(cache.pending_containers().is_empty());
        cache.container_mut(&id).unwrap().set_cpuset_cpus("0-3");
        assert_eq!(cache.pending_containers(), vec![id.clone()]);
        cache.container_mut(&id).unwrap().clear_pending();
        assert!(cache.pending_containers().is_empty());
    }
}
