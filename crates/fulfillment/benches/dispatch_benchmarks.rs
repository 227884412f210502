use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use stockroom_core::{AggregateId, ExpectedVersion, SiteId, SiteType, Sku};
use stockroom_events::{EventEnvelope, InMemoryEventBus};
use stockroom_fulfillment::command_dispatcher::CommandDispatcher;
use stockroom_fulfillment::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
use stockroom_fulfillment::projections::CatalogProjection;
use stockroom_fulfillment::read_model::InMemorySiteStore;
use stockroom_inventory::{
    AdjustStock, CreateProduct, MovementReason, Product, ProductCommand, ProductCreated,
    ProductEvent, ProductId, StockAdjusted,
};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

fn setup_dispatcher() -> (CommandDispatcher<InMemoryEventStore, Bus>, SiteId) {
    let store = InMemoryEventStore::new();
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    (CommandDispatcher::new(store, bus), SiteId::new())
}

fn create_command(site_id: SiteId, product_id: ProductId, sku: &str) -> ProductCommand {
    ProductCommand::CreateProduct(CreateProduct {
        site_id,
        site_type: SiteType::Store,
        product_id,
        sku: Sku::new(sku).unwrap(),
        name: "Bench Widget".to_string(),
        category: "bench".to_string(),
        unit_cost: 100,
        unit_price: 200,
        location: None,
        occurred_at: Utc::now(),
    })
}

fn adjust_command(site_id: SiteId, product_id: ProductId, delta: i64) -> ProductCommand {
    ProductCommand::AdjustStock(AdjustStock {
        site_id,
        product_id,
        delta,
        reason: MovementReason::Adjustment,
        reference: None,
        occurred_at: Utc::now(),
    })
}

fn bench_command_dispatch_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_dispatch_latency");
    group.sample_size(1000);

    group.bench_function("create_product_fresh", |b| {
        let (dispatcher, site_id) = setup_dispatcher();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let product_id = ProductId::new(AggregateId::new());
            dispatcher
                .dispatch(
                    site_id,
                    product_id.0,
                    "inventory.product",
                    &create_command(site_id, product_id, &format!("BENCH-{n}")),
                    |id| Product::empty(ProductId(id)),
                )
                .unwrap();
        });
    });

    group.bench_function("adjust_stock_with_history", |b| {
        let (dispatcher, site_id) = setup_dispatcher();
        let product_id = ProductId::new(AggregateId::new());
        dispatcher
            .dispatch(
                site_id,
                product_id.0,
                "inventory.product",
                &create_command(site_id, product_id, "BENCH-HIST"),
                |id| Product::empty(ProductId(id)),
            )
            .unwrap();

        b.iter(|| {
            dispatcher
                .dispatch(
                    site_id,
                    product_id.0,
                    "inventory.product",
                    &adjust_command(site_id, product_id, black_box(5)),
                    |id| Product::empty(ProductId(id)),
                )
                .unwrap();
        });
    });

    group.finish();
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("batch_append", batch_size),
            &batch_size,
            |b, &size| {
                let store = InMemoryEventStore::new();
                let site_id = SiteId::new();
                let aggregate_id = AggregateId::new();
                let product_id = ProductId::new(aggregate_id);

                b.iter(|| {
                    let events: Vec<UncommittedEvent> = (0..size)
                        .map(|i| {
                            let event = ProductEvent::StockAdjusted(StockAdjusted {
                                site_id,
                                product_id,
                                delta: i as i64,
                                reason: MovementReason::Adjustment,
                                reference: None,
                                forced: false,
                                occurred_at: Utc::now(),
                            });
                            UncommittedEvent::from_typed(
                                site_id,
                                aggregate_id,
                                "inventory.product",
                                uuid::Uuid::now_v7(),
                                &event,
                            )
                            .unwrap()
                        })
                        .collect();

                    black_box(store.append(events, ExpectedVersion::Any).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_projection_rebuild_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_rebuild_speed");

    for event_count in [10usize, 100, 1000, 10000] {
        group.bench_with_input(
            BenchmarkId::new("rebuild_from_events", event_count),
            &event_count,
            |b, &count| {
                let store = InMemoryEventStore::new();
                let site_id = SiteId::new();
                let aggregate_id = AggregateId::new();
                let product_id = ProductId::new(aggregate_id);

                let mut envelopes = Vec::with_capacity(count);
                let created = ProductEvent::ProductCreated(ProductCreated {
                    site_id,
                    product_id,
                    sku: Sku::new("BENCH-RB").unwrap(),
                    name: "Bench Widget".to_string(),
                    category: "bench".to_string(),
                    unit_cost: 100,
                    unit_price: 200,
                    location: None,
                    occurred_at: Utc::now(),
                });
                let uncommitted = UncommittedEvent::from_typed(
                    site_id,
                    aggregate_id,
                    "inventory.product",
                    uuid::Uuid::now_v7(),
                    &created,
                )
                .unwrap();
                let stored = store.append(vec![uncommitted], ExpectedVersion::Any).unwrap();
                envelopes.push(stored[0].to_envelope());

                for i in 0..(count - 1) {
                    let adjusted = ProductEvent::StockAdjusted(StockAdjusted {
                        site_id,
                        product_id,
                        delta: (i % 10) as i64,
                        reason: MovementReason::Adjustment,
                        reference: None,
                        forced: false,
                        occurred_at: Utc::now(),
                    });
                    let uncommitted = UncommittedEvent::from_typed(
                        site_id,
                        aggregate_id,
                        "inventory.product",
                        uuid::Uuid::now_v7(),
                        &adjusted,
                    )
                    .unwrap();
                    let stored = store
                        .append(vec![uncommitted], ExpectedVersion::Exact((i + 1) as u64))
                        .unwrap();
                    envelopes.push(stored[0].to_envelope());
                }

                let projection = CatalogProjection::new(InMemorySiteStore::new());
                b.iter(|| {
                    projection
                        .rebuild_from_scratch(site_id, black_box(envelopes.clone()))
                        .unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_dispatch_latency,
    bench_event_append_throughput,
    bench_projection_rebuild_speed
);
criterion_main!(benches);
