//! Delivery engine and instance registry throughput benchmarks.
//!
//! Mirrors the teacher's `message_routing` benchmark shape: a Tokio runtime
//! driving async operations under Criterion, grouped by the dimension that
//! actually varies (recipient count, message size, concurrency).

use agent_hub::domain_types::AgentId;
use agent_hub::hub::config::{AckTimeoutMs, EvictionAgeMs, HubConfig, MaxRetries};
use agent_hub::hub::delivery::DeliveryEngineImpl;
use agent_hub::hub::dispatch::DispatchFabricImpl;
use agent_hub::hub::domain_types::{InstanceId, SendOptions, SendTarget};
use agent_hub::hub::event_bus::EventBusImpl;
use agent_hub::hub::registry::InstanceRegistryImpl;
use agent_hub::hub::session::SessionTable;
use agent_hub::hub::traits::{DeliveryEngine, EventBus, InstanceRegistry};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

fn no_retry_config() -> HubConfig {
    HubConfig::builder()
        .max_retries(MaxRetries::try_new(1).expect("valid"))
        .ack_timeout_ms(AckTimeoutMs::try_new(60_000).expect("valid"))
        .eviction_age_ms(EvictionAgeMs::try_new(120_000).expect("valid"))
        .build()
        .expect("valid bench config")
}

fn agent(id: &str) -> AgentId {
    AgentId::try_new(id.to_string()).expect("valid bench agent id")
}

fn instance(id: &str) -> InstanceId {
    InstanceId::try_new(id.to_string()).expect("valid bench instance id")
}

fn bench_send_a2a(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("send_a2a");

    group.bench_function("single_online_recipient", |b| {
        b.to_async(&rt).iter(|| async {
            let registry = Arc::new(InstanceRegistryImpl::new());
            let event_bus: Arc<dyn EventBus> = Arc::new(EventBusImpl::new());
            let sessions = SessionTable::new();
            let dispatch = Arc::new(DispatchFabricImpl::new(sessions.clone(), event_bus));
            let engine = DeliveryEngineImpl::new(
                Arc::clone(&registry) as Arc<dyn InstanceRegistry>,
                dispatch,
                no_retry_config(),
            );

            let b_id = agent("bench-recipient");
            let (tx, _rx) = mpsc::unbounded_channel();
            sessions.insert(b_id.clone(), instance("r1"), agent_hub::hub::domain_types::SessionId::generate(), HashSet::new(), tx);
            registry
                .register(b_id.clone(), instance("r1"), HashSet::new(), None)
                .await;

            let result = DeliveryEngine::send(
                &engine,
                agent("bench-sender"),
                SendTarget::Single(b_id),
                json!("benchmark payload"),
                SendOptions::default(),
            )
            .await;
            black_box(result)
        });
    });

    group.finish();
}

fn bench_send_a2ma_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("send_a2ma_fanout");

    for recipient_count in [2, 10, 50].iter() {
        group.bench_with_input(
            BenchmarkId::new("recipients", recipient_count),
            recipient_count,
            |b, &recipient_count| {
                b.to_async(&rt).iter(|| async move {
                    let registry = Arc::new(InstanceRegistryImpl::new());
                    let event_bus: Arc<dyn EventBus> = Arc::new(EventBusImpl::new());
                    let sessions = SessionTable::new();
                    let dispatch = Arc::new(DispatchFabricImpl::new(sessions.clone(), event_bus));
                    let engine = DeliveryEngineImpl::new(
                        Arc::clone(&registry) as Arc<dyn InstanceRegistry>,
                        dispatch,
                        no_retry_config(),
                    );

                    let mut recipients = HashSet::new();
                    for i in 0..recipient_count {
                        let id = agent(&format!("bench-recipient-{i}"));
                        let (tx, _rx) = mpsc::unbounded_channel();
                        sessions.insert(
                            id.clone(),
                            instance("r1"),
                            agent_hub::hub::domain_types::SessionId::generate(),
                            HashSet::new(),
                            tx,
                        );
                        registry
                            .register(id.clone(), instance("r1"), HashSet::new(), None)
                            .await;
                        recipients.insert(id);
                    }

                    let result = DeliveryEngine::send(
                        &engine,
                        agent("bench-sender"),
                        SendTarget::Set(recipients),
                        json!("fanout payload"),
                        SendOptions::default(),
                    )
                    .await;
                    black_box(result)
                });
            },
        );
    }

    group.finish();
}

fn bench_registry_live_lookup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("registry_live_lookup");

    for instance_count in [10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::new("instances_registered", instance_count),
            instance_count,
            |b, &instance_count| {
                b.to_async(&rt).iter_batched(
                    || {
                        let registry = InstanceRegistryImpl::new();
                        rt.block_on(async {
                            for i in 0..instance_count {
                                registry
                                    .register(
                                        agent("bench-lookup-target"),
                                        instance(&format!("i{i}")),
                                        HashSet::new(),
                                        None,
                                    )
                                    .await;
                            }
                            registry
                        })
                    },
                    |registry| async move {
                        let live = registry.live_instances(agent("bench-lookup-target")).await;
                        black_box(live)
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_send_a2a,
    bench_send_a2ma_fanout,
    bench_registry_live_lookup
);
criterion_main!(benches);
