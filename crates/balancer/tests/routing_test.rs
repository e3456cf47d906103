//! Registry-level routing scenarios exercised end to end.

use serde_json::json;

use alicia_balancer::{Algorithm, HealthStatus, LoadBalancer};
use alicia_core::AliciaError;

fn register(service: &str, instance: &str) -> serde_json::Value {
    json!({
        "service_name": service,
        "instance_id": instance,
        "host": format!("{instance}.local"),
        "port": 8000,
    })
}

#[tokio::test]
async fn three_instances_round_robin_twice() {
    let lb = LoadBalancer::default();
    for id in ["A", "B", "C"] {
        lb.apply_register(&register("s", id)).await;
    }

    let mut sequence = Vec::new();
    for _ in 0..6 {
        let decision = lb.route("s").await.unwrap();
        sequence.push(decision.instance_id.clone());
        lb.complete("s", &decision.instance_id, true).await.unwrap();
    }
    assert_eq!(sequence, vec!["A", "B", "C", "A", "B", "C"]);
}

#[tokio::test]
async fn breaker_opens_after_six_failures_and_probes_after_recovery() {
    // Zero recovery timeout lets the probe happen on the next route call.
    let lb = LoadBalancer::new(5, 0.0);
    lb.apply_register(&register("s", "X")).await;

    for i in 0..6 {
        let routed = lb.route("s").await;
        let decision = match routed {
            Ok(d) => d,
            // While open (pre-probe) routing may momentarily fail; with
            // zero recovery the next call half-opens.
            Err(_) => lb.route("s").await.unwrap(),
        };
        assert_eq!(decision.instance_id, "X", "iteration {i}");
        lb.complete("s", "X", false).await.unwrap();
    }

    let views = lb.instances_of("s").await.unwrap();
    assert_eq!(views[0].instance.health_status, HealthStatus::Unhealthy);
    assert!(views[0].instance.failed_requests >= 6);

    // Recovery elapsed: the next route offers X as a half-open probe and a
    // success restores it.
    let decision = lb.route("s").await.unwrap();
    assert_eq!(decision.instance_id, "X");
    lb.complete("s", "X", true).await.unwrap();

    let views = lb.instances_of("s").await.unwrap();
    assert_eq!(views[0].instance.health_status, HealthStatus::Healthy);
}

#[tokio::test]
async fn algorithm_switch_takes_effect() {
    let lb = LoadBalancer::default();
    lb.apply_register(&register("s", "b")).await;
    lb.apply_register(&register("s", "a")).await;

    lb.set_algorithm("s", Algorithm::LeastConnections).await;
    let decision = lb.route("s").await.unwrap();
    // Tie on connections: lowest instance id wins.
    assert_eq!(decision.instance_id, "a");
}

#[tokio::test]
async fn no_instances_and_no_healthy_instances_are_distinct() {
    let lb = LoadBalancer::default();
    assert!(matches!(lb.route("s").await, Err(AliciaError::NotFound(_))));

    lb.apply_register(&register("s", "a")).await;
    lb.apply_health(&json!({
        "service_name": "s",
        "instance_id": "a",
        "status": "unhealthy",
    }))
    .await;
    assert!(matches!(lb.route("s").await, Err(AliciaError::Overload(_))));
}
