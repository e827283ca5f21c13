//! End-to-end arbitration scenarios through the full pipeline: embargo
//! batch, detection, splitting, solve, safety, commit.

use rust_decimal_macros::dec;
use serde_json::json;

use fairshare_arbiter::{ArbitrationRequest, ArbitrationScheduler, ScenarioSpec};
use fairshare_core::ResourceType;

const C: ResourceType = ResourceType::Compute;
const M: ResourceType = ResourceType::Memory;
const S: ResourceType = ResourceType::Storage;
const N: ResourceType = ResourceType::Network;
const D: ResourceType = ResourceType::Dataset;
const API: ResourceType = ResourceType::ApiCredits;

fn scheduler(spec: serde_json::Value) -> ArbitrationScheduler {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let spec: ScenarioSpec = serde_json::from_value(spec).unwrap();
    ArbitrationScheduler::from_spec(&spec).unwrap()
}

fn linear_agent(id: &str, minimum: u64, ideal: u64, currency: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": id.to_uppercase(),
        "minimums": { "compute": minimum },
        "ideals": { "compute": ideal },
        "utility": { "kind": "linear", "weights": { "compute": 1.0 } },
        "initial_currency": currency
    })
}

#[tokio::test]
async fn basic_mechanism_splits_proportionally_after_minimums() {
    let mut scheduler = scheduler(json!({
        "pool": { "compute": 100 },
        "agents": [
            linear_agent("a1", 40, 80, "0"),
            linear_agent("a2", 30, 70, "0"),
        ]
    }));

    scheduler.submit(ArbitrationRequest::new("a1"));
    scheduler.submit(ArbitrationRequest::new("a2"));
    let report = scheduler.flush_and_run().await;

    assert!(report.committed());
    assert_eq!(report.allocations["a1"].get(C), 55);
    assert_eq!(report.allocations["a2"].get(C), 45);
    assert_eq!(scheduler.pool().available(C), 0);
    scheduler.verify_state().unwrap();
}

#[tokio::test]
async fn weighted_tilt_follows_burned_currency() {
    let mut scheduler = scheduler(json!({
        "pool": { "compute": 100 },
        "agents": [
            linear_agent("a1", 40, 80, "50"),
            linear_agent("a2", 30, 70, "0"),
        ]
    }));

    scheduler.submit(ArbitrationRequest::new("a1").with_burn(dec!(50)));
    scheduler.submit(ArbitrationRequest::new("a2"));
    let report = scheduler.flush_and_run().await;

    assert!(report.committed());
    assert_eq!(report.allocations["a1"].get(C), 66);
    assert_eq!(report.allocations["a2"].get(C), 34);
    scheduler.verify_state().unwrap();
}

#[tokio::test]
async fn collusion_cannot_push_a_victim_below_its_minimum() {
    let mut agents = vec![linear_agent("victim", 20, 50, "0")];
    for i in 0..100 {
        agents.push(linear_agent(&format!("attacker-{i:03}"), 1, 10, "10"));
    }

    let mut scheduler = scheduler(json!({
        "pool": { "compute": 500 },
        "agents": agents
    }));

    scheduler.submit(ArbitrationRequest::new("victim"));
    for i in 0..100 {
        scheduler
            .submit(ArbitrationRequest::new(format!("attacker-{i:03}")).with_burn(dec!(10)));
    }

    let report = scheduler.flush_and_run().await;
    assert!(report.committed());

    let victim = report.allocations["victim"].get(C);
    assert!(victim >= 20, "victim pushed to {victim}");

    let total: u64 = report.allocations.values().map(|b| b.get(C)).sum();
    assert!(total <= 500);
    scheduler.verify_state().unwrap();
}

fn paretotopia_spec(mechanism: &str) -> serde_json::Value {
    let specialist = |id: &str, own: &str, other: &str| {
        json!({
            "id": id,
            "name": id.to_uppercase(),
            "ideals": { "compute": 100, "storage": 100 },
            "utility": {
                "kind": "log",
                "weights": { own: 0.9, other: 0.1 }
            },
            "initial_currency": "0"
        })
    };
    json!({
        "pool": { "compute": 100, "storage": 100 },
        "mechanism": mechanism,
        "agents": [
            specialist("s-comp", "compute", "storage"),
            specialist("s-stor", "storage", "compute"),
        ]
    })
}

#[tokio::test]
async fn joint_arbitration_reaches_welfare_sequential_cannot() {
    let mut sequential = scheduler(paretotopia_spec("proportional_fairness"));
    sequential.submit(ArbitrationRequest::new("s-comp"));
    sequential.submit(ArbitrationRequest::new("s-stor"));
    let sequential_report = sequential.flush_and_run().await;
    assert!(sequential_report.committed());

    let mut joint = scheduler(paretotopia_spec("gradient_joint"));
    joint.submit(ArbitrationRequest::new("s-comp"));
    joint.submit(ArbitrationRequest::new("s-stor"));
    let joint_report = joint.flush_and_run().await;
    assert!(joint_report.committed());

    // The joint solve tilts each specialist toward its preferred resource;
    // per-resource sequential PF cannot see across axes and splits evenly.
    assert_eq!(sequential_report.allocations["s-comp"].get(C), 50);
    let comp_share = joint_report.allocations["s-comp"].get(C);
    let stor_share = joint_report.allocations["s-stor"].get(S);
    assert!(comp_share >= 60, "s-comp got only {comp_share} compute");
    assert!(stor_share >= 60, "s-stor got only {stor_share} storage");

    assert!(
        joint_report.welfare > sequential_report.welfare,
        "joint {} <= sequential {}",
        joint_report.welfare,
        sequential_report.welfare
    );

    sequential.verify_state().unwrap();
    joint.verify_state().unwrap();
}

/// The three workload footprints from the README's six-resource example.
fn six_resource_spec(mechanism: &str) -> serde_json::Value {
    json!({
        "pool": {
            "compute": 100, "memory": 100, "storage": 120,
            "network": 80, "dataset": 60, "api_credits": 80
        },
        "mechanism": mechanism,
        "agents": [
            {
                "id": "ml_train",
                "name": "ML Training",
                "minimums": { "compute": 30, "memory": 20, "dataset": 10 },
                "ideals": { "compute": 60, "memory": 50, "storage": 40, "dataset": 30 },
                "utility": {
                    "kind": "log",
                    "weights": { "compute": 0.5, "memory": 0.2, "storage": 0.1, "dataset": 0.2 }
                },
                "initial_currency": "100"
            },
            {
                "id": "data_pipe",
                "name": "Data Pipeline",
                "minimums": { "storage": 30, "network": 10 },
                "ideals": { "compute": 20, "memory": 30, "storage": 80, "network": 40, "dataset": 20 },
                "utility": {
                    "kind": "log",
                    "weights": { "compute": 0.1, "memory": 0.1, "storage": 0.5, "network": 0.2, "dataset": 0.1 }
                },
                "initial_currency": "100"
            },
            {
                "id": "api_svc",
                "name": "API Service",
                "minimums": { "compute": 10, "api_credits": 20 },
                "ideals": { "compute": 30, "memory": 30, "network": 50, "api_credits": 60 },
                "utility": {
                    "kind": "log",
                    "weights": { "compute": 0.2, "memory": 0.1, "network": 0.3, "api_credits": 0.4 }
                },
                "initial_currency": "100"
            }
        ]
    })
}

#[tokio::test]
async fn six_resource_joint_beats_sequential_with_one_commit() {
    let mut sequential = scheduler(six_resource_spec("proportional_fairness"));
    for id in ["ml_train", "data_pipe", "api_svc"] {
        sequential.submit(ArbitrationRequest::new(id));
    }
    let sequential_report = sequential.flush_and_run().await;
    assert!(sequential_report.committed());

    let mut joint = scheduler(six_resource_spec("gradient_joint"));
    for id in ["ml_train", "data_pipe", "api_svc"] {
        joint.submit(ArbitrationRequest::new(id));
    }
    let report = joint.flush_and_run().await;
    assert!(report.committed());

    assert!(
        report.welfare >= sequential_report.welfare - 1e-6,
        "joint {} < sequential {}",
        report.welfare,
        sequential_report.welfare
    );

    // Capacity, box, and integrality all hold.
    joint.verify_state().unwrap();
    for (resource, capacity) in [(C, 100), (M, 100), (S, 120), (N, 80), (D, 60), (API, 80)] {
        let total: u64 = report.allocations.values().map(|b| b.get(resource)).sum();
        assert!(total <= capacity, "{resource} over capacity: {total}");
    }

    // Exactly one commit in the transaction log.
    let commits = joint
        .transaction_manager()
        .transaction_log()
        .iter()
        .filter(|line| line.contains("[TXN-COMMIT]"))
        .count();
    assert_eq!(commits, 1);
}

/// Five agents overlapping pairwise on a chain of resources.
fn chain_spec(policy: serde_json::Value) -> serde_json::Value {
    let agent = |id: &str, wants: &[&str]| {
        let ideals: serde_json::Map<String, serde_json::Value> = wants
            .iter()
            .map(|r| (r.to_string(), json!(60)))
            .collect();
        let weights: serde_json::Map<String, serde_json::Value> = wants
            .iter()
            .map(|r| (r.to_string(), json!(1.0)))
            .collect();
        json!({
            "id": id,
            "name": id.to_uppercase(),
            "ideals": ideals,
            "utility": { "kind": "linear", "weights": weights },
            "initial_currency": "0"
        })
    };

    json!({
        "pool": { "compute": 100, "memory": 100, "storage": 100, "network": 100 },
        "policy": policy,
        "agents": [
            agent("a", &["compute"]),
            agent("b", &["compute", "memory"]),
            agent("c", &["memory", "storage"]),
            agent("d", &["storage", "network"]),
            agent("e", &["network"]),
        ]
    })
}

async fn run_chain(policy: serde_json::Value) -> (ArbitrationScheduler, fairshare_arbiter::CycleReport) {
    let mut scheduler = scheduler(chain_spec(policy));
    for id in ["a", "b", "c", "d", "e"] {
        scheduler.submit(ArbitrationRequest::new(id));
    }
    let report = scheduler.flush_and_run().await;
    (scheduler, report)
}

#[tokio::test]
async fn k_hop_chain_grouping_never_violates_conservation() {
    // k=1: pairs {a,b} and {c,d}, e alone.
    let (scheduler_k1, report_k1) = run_chain(json!({ "k_hop_limit": 1 })).await;
    assert!(report_k1.committed());
    assert_eq!(report_k1.group_count, 3);

    // k=2: {a,b,c} and {d,e}.
    let (scheduler_k2, report_k2) = run_chain(json!({ "k_hop_limit": 2 })).await;
    assert!(report_k2.committed());
    assert_eq!(report_k2.group_count, 2);

    // Unlimited: one group of five.
    let (scheduler_all, report_all) = run_chain(json!({})).await;
    assert!(report_all.committed());
    assert_eq!(report_all.group_count, 1);

    for (scheduler, report) in [
        (&scheduler_k1, &report_k1),
        (&scheduler_k2, &report_k2),
        (&scheduler_all, &report_all),
    ] {
        scheduler.verify_state().unwrap();
        for resource in [C, M, S, N] {
            let total: u64 = report.allocations.values().map(|b| b.get(resource)).sum();
            assert!(total <= 100, "{resource} over capacity under split policy");
        }
    }
}

#[tokio::test]
async fn identical_runs_are_deterministic() {
    let run = || async {
        let mut scheduler = scheduler(six_resource_spec("gradient_joint"));
        for id in ["ml_train", "data_pipe", "api_svc"] {
            scheduler.submit(ArbitrationRequest::new(id));
        }
        scheduler.flush_and_run().await.allocations
    };

    let first = run().await;
    for _ in 0..3 {
        assert_eq!(first, run().await);
    }
}
