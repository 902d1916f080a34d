// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

// End-to-end placement scenarios against synthetic hosts, driven
// through the same path real lifecycle events take: cache a pod and a
// container, build the request, pick a pool, book the supply.

use std::collections::BTreeMap;

use memtier::cache::{Cache, ContainerSpec, PodSpec, ResourceSpec};
use memtier::policy::{Policy, PolicyOptions};
use memtier::system::mock::MockSystem;
use memtier::{ClassMap, IdxSet, MemType, TopologyHint};

// a single-socket desktop: 4 CPUs, one NUMA node, 16 GiB of DRAM
fn desktop() -> MockSystem {
    MockSystem::new().node(0, 0, "0-3", MemType::DRAM, 16 << 30)
}

// a two-socket server: one NUMA node with 8 CPUs and 32 GiB per socket
fn server() -> MockSystem {
    MockSystem::new()
        .node(0, 0, "0-7", MemType::DRAM, 32 << 30)
        .node(1, 1, "8-15", MemType::DRAM, 32 << 30)
}

// the same server with a memory-only PMEM node attached to socket 0
fn pmem_server() -> MockSystem {
    server().node(2, 0, "", MemType::PMEM, 128 << 30)
}

fn policy(sys: MockSystem) -> Policy {
    Policy::new(Box::new(sys), PolicyOptions::default()).unwrap()
}

fn pod(id: &str, annotations: &[(&str, &str)]) -> PodSpec {
    PodSpec {
        id: id.to_string(),
        name: id.to_string(),
        namespace: "default".into(),
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

fn guaranteed(id: &str, pod_id: &str, cpu_milli: u64, mem: u64) -> ContainerSpec {
    ContainerSpec {
        id: id.to_string(),
        pod_id: pod_id.to_string(),
        name: id.to_string(),
        resources: ResourceSpec {
            cpu_request_milli: cpu_milli,
            cpu_limit_milli: cpu_milli,
            mem_request: mem,
            mem_limit: mem,
        },
        ..Default::default()
    }
}

fn burstable(id: &str, pod_id: &str, cpu_milli: u64, mem: u64) -> ContainerSpec {
    ContainerSpec {
        id: id.to_string(),
        pod_id: pod_id.to_string(),
        name: id.to_string(),
        resources: ResourceSpec {
            cpu_request_milli: cpu_milli,
            cpu_limit_milli: 0,
            mem_request: mem,
            mem_limit: mem,
        },
        ..Default::default()
    }
}

fn place(policy: &mut Policy, cache: &mut Cache, spec: ContainerSpec) -> memtier::Grant {
    let id = cache.insert_container(spec).unwrap();
    policy.allocate(cache, &id).unwrap()
}

fn check_tree_invariants(policy: &Policy) {
    let tree = policy.tree();
    for pool in tree.pools() {
        let free = &pool.freeres;
        let node = &pool.noderes;

        assert!(
            node.isolated().contains_all(&free.isolated().indices()),
            "{}: free isolated set outgrew the declared one",
            pool.name
        );
        assert!(
            node.sharable().contains_all(&free.sharable().indices()),
            "{}: free sharable set outgrew the declared one",
            pool.name
        );
        assert!(
            free.isolated().intersection(free.sharable()).is_empty(),
            "{}: isolated and sharable sets overlap",
            pool.name
        );
        assert!(
            free.granted() <= 1000 * free.sharable().len(),
            "{}: granted {} milli-CPU exceeds sharable capacity",
            pool.name,
            free.granted()
        );
    }

    // the root's CPUs are the union of the leaves'
    let mut leaves = IdxSet::new();
    for pool in tree.pools().filter(|p| p.children.is_empty()) {
        leaves.unite(&pool.noderes.cpus());
    }
    assert_eq!(tree.get(tree.root()).noderes.cpus(), leaves);
}

#[test]
fn desktop_exclusive_grant() {
    let mut policy = policy(desktop());
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[]));

    let grant = place(&mut policy, &mut cache, guaranteed("c0", "p0", 2000, 1 << 30));

    assert_eq!(grant.exclusive.len(), 2);
    assert_eq!(grant.portion, 0);
    assert_eq!(grant.memset.indices(), vec![0]);
    // the single socket is the root
    let pool = policy.tree().get(grant.cpu_node);
    assert!(pool.is_root());
    assert_eq!(pool.name, "socket #0");

    check_tree_invariants(&policy);
}

#[test]
fn server_shared_request_prefers_deep_small_id() {
    let mut policy = policy(server());
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[]));

    let grant = place(&mut policy, &mut cache, burstable("c0", "p0", 500, 1 << 30));

    assert_eq!(grant.portion, 500);
    assert!(grant.exclusive.is_empty());
    // deeper beats shallower, smallest id breaks the leaf tie
    assert_eq!(policy.tree().get(grant.cpu_node).name, "NUMA node #0");

    check_tree_invariants(&policy);
}

#[test]
fn sequential_exclusive_requests_spread_over_sockets() {
    let mut policy = policy(server());
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[]));

    let first = place(&mut policy, &mut cache, guaranteed("c0", "p0", 4000, 1 << 30));
    let second = place(&mut policy, &mut cache, guaranteed("c1", "p0", 4000, 1 << 30));

    let tree = policy.tree();
    let socket_of = |id: usize| tree.ancestors(id).first().copied().unwrap_or(id);
    assert_ne!(
        socket_of(first.cpu_node),
        socket_of(second.cpu_node),
        "both exclusive grants landed on the same socket"
    );

    check_tree_invariants(&policy);
}

#[test]
fn pmem_request_matches_socket_with_pmem() {
    let mut policy = policy(pmem_server());
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[("memory-type.memtier.io/pod", "pmem")]));

    let grant = place(&mut policy, &mut cache, guaranteed("c0", "p0", 500, 10 << 30));

    assert_eq!(policy.tree().get(grant.cpu_node).name, "socket #0");
    assert!(grant.memset.contains(2));

    check_tree_invariants(&policy);
}

#[test]
fn memory_filter_pushes_large_requests_to_the_root() {
    let sys = server();
    sys.set_free_mem(0, 6 << 30);
    sys.set_free_mem(1, 6 << 30);

    let mut policy = policy(sys);
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[]));

    let grant = place(&mut policy, &mut cache, guaranteed("c0", "p0", 500, 10 << 30));

    // 6 GiB per leaf cannot hold 10 GiB; only the root survives the
    // filter and its memset spans both controllers
    let pool = policy.tree().get(grant.cpu_node);
    assert!(pool.is_root());
    assert_eq!(grant.memset.indices(), vec![0, 1]);

    check_tree_invariants(&policy);
}

#[test]
fn insufficient_memory_everywhere_is_an_error() {
    let sys = desktop();
    sys.set_free_mem(0, 1 << 30);

    let mut policy = policy(sys);
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[]));
    let id = cache
        .insert_container(guaranteed("c0", "p0", 500, 8 << 30))
        .unwrap();

    let err = policy.allocate(&mut cache, &id).unwrap_err();
    assert!(err.to_string().contains("insufficient resources"));
}

#[test]
fn runtime_class_matching() {
    let classes = ClassMap::default();
    assert_eq!(classes.match_handler("kata-qemu"), Some("kata"));
    assert_eq!(classes.match_handler("runc"), Some("cri"));
    assert_eq!(classes.match_handler(""), Some("cri"));
}

#[test]
fn system_namespace_pins_to_root() {
    let mut policy = policy(server());
    let mut cache = Cache::new();
    cache.insert_pod(PodSpec {
        id: "kube-proxy".into(),
        name: "kube-proxy".into(),
        namespace: "kube-system".into(),
        ..Default::default()
    });

    let grant = place(
        &mut policy,
        &mut cache,
        burstable("c0", "kube-proxy", 100, 1 << 30),
    );
    assert!(policy.tree().get(grant.cpu_node).is_root());
}

#[test]
fn isolated_cpus_are_used_on_opt_in() {
    let sys = MockSystem::new()
        .node(0, 0, "0-7", MemType::DRAM, 32 << 30)
        .isolated("6-7");
    let mut policy = policy(sys);
    let mut cache = Cache::new();
    cache.insert_pod(pod(
        "p0",
        &[("prefer-isolated-cpus.memtier.io/pod", "true")],
    ));

    let grant = place(&mut policy, &mut cache, guaranteed("c0", "p0", 2000, 1 << 30));
    assert_eq!(grant.exclusive, "6-7".parse().unwrap());

    check_tree_invariants(&policy);
}

#[test]
fn affinity_pulls_toward_peer_pool() {
    let mut policy = policy(server());
    let mut cache = Cache::new();
    cache.insert_pod(pod(
        "p0",
        &[(
            "affinity.memtier.io/container.c1",
            r#"[{"match": {"key": "name", "op": "Equal", "values": ["c0"]}, "weight": 10}]"#,
        )],
    ));

    // park the first container on the second socket's leaf by eating
    // the first leaf's shared capacity
    let _filler = place(&mut policy, &mut cache, burstable("f0", "p0", 7800, 1 << 30));
    let peer = place(&mut policy, &mut cache, burstable("c0", "p0", 100, 1 << 30));
    let peer_pool = peer.cpu_node;

    let follower = place(&mut policy, &mut cache, burstable("c1", "p0", 100, 1 << 30));
    assert_eq!(
        follower.cpu_node, peer_pool,
        "affinity failed to pull the follower next to its peer"
    );

    check_tree_invariants(&policy);
}

#[test]
fn avx512_anti_affinity_pushes_away() {
    let mut policy = policy(server());
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[("tags.memtier.io/container.avx", "AVX512")]));

    let avx = place(&mut policy, &mut cache, burstable("avx", "p0", 100, 1 << 30));
    let plain = place(&mut policy, &mut cache, burstable("plain", "p0", 100, 1 << 30));

    assert_ne!(
        avx.cpu_node, plain.cpu_node,
        "untagged container was not pushed away from the AVX512 one"
    );

    check_tree_invariants(&policy);
}

#[test]
fn topology_hints_bias_placement() {
    let mut policy = policy(server());
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[]));

    let mut spec = burstable("c0", "p0", 100, 1 << 30);
    spec.hints = BTreeMap::from([(
        "nic0".to_string(),
        TopologyHint {
            cpus: "8-15".into(),
            ..Default::default()
        },
    )]);

    let grant = place(&mut policy, &mut cache, spec);
    assert_eq!(policy.tree().get(grant.cpu_node).name, "NUMA node #1");

    check_tree_invariants(&policy);
}

#[test]
fn snapshot_restore_rebuilds_grants() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("allocations.json");

    let options = || PolicyOptions {
        state_file: Some(state_file.clone()),
        ..Default::default()
    };

    let exclusive = {
        let mut policy = Policy::new(Box::new(server()), options()).unwrap();
        let mut cache = Cache::new();
        cache.insert_pod(pod("p0", &[]));
        let grant = place(&mut policy, &mut cache, guaranteed("c0", "p0", 2000, 1 << 30));
        grant.exclusive
    };

    // a restart with the container still known re-books the same CPUs
    let mut policy = Policy::new(Box::new(server()), options()).unwrap();
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[]));
    cache
        .insert_container(guaranteed("c0", "p0", 2000, 1 << 30))
        .unwrap();
    policy.restore(&mut cache).unwrap();

    let grant = policy.allocation("c0").expect("grant not restored");
    assert_eq!(grant.exclusive, exclusive);
    let pool = policy.tree().get(grant.cpu_node);
    assert!(pool.freeres.cpus().intersection(&exclusive).is_empty());
    check_tree_invariants(&policy);

    // a restart without the container discards the grant and frees its
    // resources
    let mut policy = Policy::new(Box::new(server()), options()).unwrap();
    let mut cache = Cache::new();
    policy.restore(&mut cache).unwrap();
    assert!(policy.allocation("c0").is_none());
    for pool in policy.tree().pools() {
        assert_eq!(&pool.freeres, &pool.noderes);
    }
}

#[test]
fn release_restores_the_tree() {
    let mut policy = policy(server());
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", &[]));

    let pristine: Vec<_> = policy.tree().pools().map(|p| p.freeres.clone()).collect();

    let specs = vec![
        guaranteed("c0", "p0", 3000, 2 << 30),
        burstable("c1", "p0", 750, 1 << 30),
        guaranteed("c2", "p0", 1500, 4 << 30),
    ];
    for spec in specs {
        place(&mut policy, &mut cache, spec);
        check_tree_invariants(&policy);
    }

    for id in ["c2", "c0", "c1"] {
        assert!(policy.release(&mut cache, id).unwrap());
        check_tree_invariants(&policy);
    }

    let restored: Vec<_> = policy.tree().pools().map(|p| p.freeres.clone()).collect();
    assert_eq!(pristine, restored);
}
