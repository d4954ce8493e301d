//! End-to-end tests of the reaction loop over the in-memory backends:
//! command transaction → outbox → dispatcher → broker → consumer → agents →
//! derived envelopes back through the outbox, until quiescence.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::broadcast;

use warebus_agents::builtin::{
    FefoReservationAgent, LotExpiryAgent, SlottingSuggestionAgent, StockThresholdAgent,
};
use warebus_agents::{
    Agent, AgentContext, AgentError, AgentRegistry, AgentResult, AgentRuntime, RuntimeConfig,
};
use warebus_core::{LocationId, ProductId, TenantId, WarehouseId};
use warebus_events::{catalog, EventEnvelope, OutboxStatus, OutboxStore};
use warebus_infra::{
    default_jobs, CommandContext, CommandService, ConsumerConfig, DispatcherConfig, EventConsumer,
    GoodsReceiptCommand, InMemoryBroker, InMemoryStateStore, MessageBroker, MovementCommand,
    OutboxDispatcher, Scheduler, DEAD_LETTER_QUEUE,
};
use warebus_inventory::payloads::{LowStockDetected, SlottingSuggestionsGenerated, StockReserved};
use warebus_inventory::{
    AbcClass, AlertLevel, Location, LocationType, LotStatus, MovementType, OrderLine, Product,
    StateStore,
};

struct World {
    store: Arc<InMemoryStateStore>,
    broker: Arc<InMemoryBroker>,
    commands: CommandService,
    ctx: CommandContext,
    tenant: TenantId,
    warehouse: WarehouseId,
    shutdown: broadcast::Sender<()>,
}

impl Drop for World {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Build a running backbone. `agents` receives the world's store so the
/// handlers under test read and write the same state the commands do.
async fn world(agents: impl FnOnce(Arc<InMemoryStateStore>) -> Vec<Arc<dyn Agent>>) -> World {
    let store = Arc::new(InMemoryStateStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    broker.declare_topology().await.unwrap();

    let tenant = TenantId::new();
    let warehouse = WarehouseId::new();
    let mut tx = store.begin().await.unwrap();
    tx.put_tenant(tenant).await.unwrap();
    tx.put_warehouse(tenant, warehouse).await.unwrap();
    tx.commit().await.unwrap();

    let registry = Arc::new(AgentRegistry::new());
    for agent in agents(Arc::clone(&store)) {
        registry.register(agent);
    }
    let runtime = Arc::new(AgentRuntime::new(registry, RuntimeConfig::default()));

    let (shutdown, _) = broadcast::channel(1);

    OutboxDispatcher::new(
        store.clone(),
        broker.clone(),
        DispatcherConfig {
            poll_interval: Duration::from_millis(20),
            batch_size: 100,
        },
    )
    .spawn(shutdown.subscribe());

    EventConsumer::new(
        broker.clone(),
        store.clone(),
        runtime,
        ConsumerConfig {
            prefetch_count: 10,
            max_retries: 3,
            retry_delay_base: Duration::from_millis(10),
        },
    )
    .spawn(shutdown.subscribe());

    World {
        commands: CommandService::new(store.clone(), store.clone()),
        ctx: CommandContext {
            tenant_id: tenant,
            warehouse_id: warehouse,
            actor: warebus_events::Actor::user("operator-1", vec!["operator".into()]),
        },
        store,
        broker,
        tenant,
        warehouse,
        shutdown,
    }
}

async fn seed_product(
    world: &World,
    sku: &str,
    configure: impl FnOnce(Product) -> Product,
) -> ProductId {
    let product = configure(Product::new(world.tenant, sku, sku));
    let id = product.id;
    let mut tx = world.store.begin().await.unwrap();
    tx.put_product(product).await.unwrap();
    tx.commit().await.unwrap();
    id
}

async fn seed_location(
    world: &World,
    code: &str,
    configure: impl FnOnce(Location) -> Location,
) -> LocationId {
    let location = configure(Location::new(
        world.tenant,
        world.warehouse,
        code,
        LocationType::Pick,
    ));
    let id = location.id;
    let mut tx = world.store.begin().await.unwrap();
    tx.put_location(location).await.unwrap();
    tx.commit().await.unwrap();
    id
}

async fn receive(
    world: &World,
    product: ProductId,
    location: LocationId,
    lot: Option<(&str, NaiveDate)>,
    quantity: i64,
) {
    world
        .commands
        .record_goods_receipt(
            &world.ctx,
            GoodsReceiptCommand {
                product_id: product,
                variant_id: None,
                location_id: location,
                lot_number: lot.map(|(number, _)| number.to_string()),
                expiration_date: lot.map(|(_, date)| date),
                quantity,
            },
        )
        .await
        .unwrap();
}

/// Poll until `check` yields a value or a 5 s deadline passes.
async fn wait_for<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() <= deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn find_event(store: &InMemoryStateStore, event_type: &str) -> Option<EventEnvelope> {
    store
        .event_log()
        .await
        .into_iter()
        .find(|e| e.event_type().as_str() == event_type)
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Receipt into an empty warehouse yields a slotting suggestion whose top
/// pick is the fast, near, empty bay.
#[tokio::test]
async fn receipt_cascades_into_putaway_suggestion() {
    let world = world(|store| vec![Arc::new(SlottingSuggestionAgent::new(store)) as Arc<dyn Agent>])
        .await;

    let product = seed_product(&world, "P1", |p| p.with_abc_class(AbcClass::A)).await;
    for (code, freq, dist, seq) in
        [("A-01", 80.0, 1.0, 1), ("B-01", 50.0, 5.0, 2), ("C-01", 20.0, 9.0, 3)]
    {
        seed_location(&world, code, |l| l.with_stats(0.0, dist, freq).with_pick_sequence(seq)).await;
    }
    let dock = seed_location(&world, "RECV", |l| l.with_stats(0.0, 0.5, 0.0)).await;

    receive(&world, product, dock, None, 10).await;

    let suggestion = wait_for("slotting suggestions", || async {
        find_event(&world.store, catalog::SLOTTING_SUGGESTIONS_GENERATED).await
    })
    .await;

    let payload: SlottingSuggestionsGenerated =
        serde_json::from_value(suggestion.payload().clone()).unwrap();
    assert_eq!(payload.suggestions[0].location_code, "A-01");
    assert!(payload.suggestions[0].score > payload.suggestions[1].score);

    let received = find_event(&world.store, catalog::GOODS_RECEIVED).await.unwrap();
    assert_eq!(suggestion.causation_id(), Some(received.event_id()));
    assert_eq!(suggestion.correlation_id(), received.correlation_id());
    assert_eq!(suggestion.tenant_id(), received.tenant_id());
}

/// A 7-unit order over lots of 5 (exp 2030) and 5 (exp 2029) reserves all
/// of the earlier-expiring lot and 2 of the later one.
#[tokio::test]
async fn sales_order_reserves_fefo_across_lots() {
    let world =
        world(|store| vec![Arc::new(FefoReservationAgent::new(store)) as Arc<dyn Agent>]).await;

    let product = seed_product(&world, "P2", |p| p).await;
    let a01 = seed_location(&world, "A-01", |l| l.with_pick_sequence(1)).await;
    let a02 = seed_location(&world, "A-02", |l| l.with_pick_sequence(2)).await;

    receive(&world, product, a01, Some(("L1", day(2030, 1, 1))), 5).await;
    receive(&world, product, a02, Some(("L2", day(2029, 1, 1))), 5).await;

    let (order_id, _) = world
        .commands
        .place_sales_order(
            &world.ctx,
            vec![OrderLine {
                line: 1,
                product_id: product,
                variant_id: None,
                quantity: 7,
            }],
        )
        .await
        .unwrap();

    let reserved = wait_for("stock reservation", || async {
        find_event(&world.store, catalog::STOCK_RESERVED).await
    })
    .await;
    let payload: StockReserved = serde_json::from_value(reserved.payload().clone()).unwrap();

    assert!(payload.fully_reserved);
    assert_eq!(payload.reserved_quantity, 7);
    assert_eq!(payload.allocations.len(), 2);
    // Earlier expiry (L2, at A-02) first and in full; 2 from L1.
    assert_eq!(payload.allocations[0].location_id, a02);
    assert_eq!(payload.allocations[0].quantity, 5);
    assert_eq!(payload.allocations[1].location_id, a01);
    assert_eq!(payload.allocations[1].quantity, 2);

    wait_for("order fully allocated", || async {
        find_event(&world.store, catalog::ORDER_FULLY_ALLOCATED).await
    })
    .await;

    // Stock levels: reserved totals up, available down.
    let levels = world
        .store
        .stock_levels_for_product(world.tenant, world.warehouse, product, None)
        .await
        .unwrap();
    let total_reserved: i64 = levels.iter().map(|l| l.reserved).sum();
    let total_available: i64 = levels.iter().map(|l| l.available).sum();
    assert_eq!(total_reserved, 7);
    assert_eq!(total_available, 3);

    let reservations = world
        .store
        .reservations_for_reference(world.tenant, "SALES_ORDER", &order_id.to_string())
        .await
        .unwrap();
    assert_eq!(reservations.len(), 2);
}

/// Shipping through the reorder point warns; shipping through safety stock
/// escalates to critical.
#[tokio::test]
async fn low_stock_alerts_cascade_with_escalation() {
    let world =
        world(|store| vec![Arc::new(StockThresholdAgent::new(store)) as Arc<dyn Agent>]).await;

    let product = seed_product(&world, "P3", |p| p.with_thresholds(10, 3)).await;
    let location = seed_location(&world, "A-01", |l| l).await;
    receive(&world, product, location, None, 11).await;

    let ship = |quantity: i64| {
        world.commands.record_movement(
            &world.ctx,
            MovementCommand {
                movement_type: MovementType::Ship,
                product_id: product,
                variant_id: None,
                location_id: location,
                lot_id: None,
                quantity,
                to_location_id: None,
                allow_negative: false,
            },
        )
    };

    // 11 → 9: WARNING.
    ship(2).await.unwrap();
    let warning = wait_for("warning alert", || async {
        find_event(&world.store, catalog::LOW_STOCK_DETECTED).await
    })
    .await;
    let payload: LowStockDetected = serde_json::from_value(warning.payload().clone()).unwrap();
    assert_eq!(payload.alert_level, AlertLevel::Warning);
    assert_eq!(payload.available, 9);

    // 9 → 2: CRITICAL, as a second alert.
    ship(7).await.unwrap();
    let critical = wait_for("critical alert", || async {
        let alerts: Vec<EventEnvelope> = world
            .store
            .event_log()
            .await
            .into_iter()
            .filter(|e| e.event_type().as_str() == catalog::LOW_STOCK_DETECTED)
            .collect();
        (alerts.len() == 2).then(|| alerts[1].clone())
    })
    .await;
    let payload: LowStockDetected = serde_json::from_value(critical.payload().clone()).unwrap();
    assert_eq!(payload.alert_level, AlertLevel::Critical);
    assert_eq!(payload.available, 2);
}

/// The scheduled expiry sweep quarantines a lot that expired yesterday and
/// reports one day of lateness.
#[tokio::test]
async fn scheduled_sweep_expires_yesterdays_lot() {
    let world = world(|store| vec![Arc::new(LotExpiryAgent::new(store)) as Arc<dyn Agent>]).await;

    let product = seed_product(&world, "P4", |p| p).await;
    let location = seed_location(&world, "A-01", |l| l).await;
    let yesterday = chrono::Utc::now().date_naive() - chrono::Duration::days(1);
    receive(&world, product, location, Some(("L3", yesterday)), 20).await;

    let scheduler = Scheduler::new(world.store.clone(), world.store.clone(), default_jobs(), 7);
    let sweep = default_jobs().into_iter().find(|j| j.name == "lot-expiry-check").unwrap();
    scheduler.fire(&sweep, chrono::Utc::now()).await;

    let expired = wait_for("lot expired event", || async {
        find_event(&world.store, catalog::LOT_EXPIRED).await
    })
    .await;
    assert_eq!(expired.payload()["action_taken"], "AUTO_QUARANTINE");
    assert_eq!(expired.payload()["days_expired"], 1);
    assert_eq!(expired.payload()["quantity_quarantined"], 20);

    let lots = world.store.lots(world.tenant).await.unwrap();
    assert_eq!(lots[0].status, LotStatus::Expired);

    // The 20 units left pickable inventory and sit in quarantine.
    let levels = world
        .store
        .stock_levels_for_product(world.tenant, world.warehouse, product, None)
        .await
        .unwrap();
    assert_eq!(levels[0].on_hand, 0);
    assert_eq!(levels[0].quarantined, 20);
    assert_eq!(levels[0].available, 0);

    // The sweep envelope itself is in the log and caused the expiry event.
    let tick = find_event(&world.store, catalog::SCHEDULED_EXPIRY_CHECK).await.unwrap();
    assert_eq!(expired.causation_id(), Some(tick.event_id()));
}

struct PoisonAgent;

#[async_trait]
impl Agent for PoisonAgent {
    fn name(&self) -> &str {
        "poison"
    }
    fn description(&self) -> &str {
        "fails with an infrastructure error on every delivery"
    }
    fn subscriptions(&self) -> &[&str] {
        &[catalog::GOODS_RECEIVED]
    }
    async fn handle(
        &self,
        _envelope: &EventEnvelope,
        _ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        Err(AgentError::Infrastructure("simulated store outage".into()))
    }
}

/// An agent that always fails retriably exhausts the redelivery budget:
/// the message lands in the DLQ while its outbox row stays PUBLISHED.
#[tokio::test]
async fn retry_exhaustion_dead_letters_the_envelope() {
    let world = world(|_| vec![Arc::new(PoisonAgent) as Arc<dyn Agent>]).await;
    let mut dlq = world.broker.consume(DEAD_LETTER_QUEUE).await.unwrap();

    let product = seed_product(&world, "P5", |p| p).await;
    let location = seed_location(&world, "A-01", |l| l).await;
    receive(&world, product, location, None, 1).await;

    let received = find_event(&world.store, catalog::GOODS_RECEIVED).await.unwrap();

    let dead = tokio::time::timeout(Duration::from_secs(5), dlq.next())
        .await
        .expect("dead letter within deadline")
        .unwrap();
    assert_eq!(dead.message_id, received.event_id().to_string());
    // Initial delivery + 3 redeliveries were attempted.
    assert_eq!(dead.retry_count(), 3);
    dead.ack().await.unwrap();

    // The failure was downstream of publish: the outbox row is terminal
    // PUBLISHED and nothing was derived.
    let entry = world
        .store
        .outbox_entries()
        .await
        .into_iter()
        .find(|e| e.id == received.event_id())
        .unwrap();
    assert_eq!(entry.status, OutboxStatus::Published);
    assert!(find_event(&world.store, catalog::SLOTTING_SUGGESTIONS_GENERATED).await.is_none());
}

/// A republished envelope (crash between broker ack and `mark_published`)
/// reaches the consumer twice but mutates state once.
#[tokio::test]
async fn duplicate_publish_is_absorbed_by_the_event_id_guard() {
    let world =
        world(|store| vec![Arc::new(FefoReservationAgent::new(store)) as Arc<dyn Agent>]).await;

    let product = seed_product(&world, "P6", |p| p).await;
    let location = seed_location(&world, "A-01", |l| l).await;
    receive(&world, product, location, Some(("L1", day(2030, 1, 1))), 10).await;

    let (order_id, placed) = world
        .commands
        .place_sales_order(
            &world.ctx,
            vec![OrderLine {
                line: 1,
                product_id: product,
                variant_id: None,
                quantity: 4,
            }],
        )
        .await
        .unwrap();

    wait_for("first reservation", || async {
        find_event(&world.store, catalog::STOCK_RESERVED).await
    })
    .await;

    // Crash window: the row republishes with the same message_id.
    world.store.requeue(placed.event_id()).await.unwrap();

    wait_for("republished row re-settled", || async {
        let entry = world
            .store
            .outbox_entries()
            .await
            .into_iter()
            .find(|e| e.id == placed.event_id())?;
        (entry.status == OutboxStatus::Published && entry.published_at.is_some()).then_some(())
    })
    .await;
    // Give the duplicate delivery time to flow through the consumer.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reservations = world
        .store
        .reservations_for_reference(world.tenant, "SALES_ORDER", &order_id.to_string())
        .await
        .unwrap();
    assert_eq!(reservations.len(), 1);

    let reserved_events: Vec<EventEnvelope> = world
        .store
        .event_log()
        .await
        .into_iter()
        .filter(|e| e.event_type().as_str() == catalog::STOCK_RESERVED)
        .collect();
    assert_eq!(reserved_events.len(), 1);

    let levels = world
        .store
        .stock_levels_for_product(world.tenant, world.warehouse, product, None)
        .await
        .unwrap();
    assert_eq!(levels[0].reserved, 4);
}

/// Universal invariants over a full cascade: every causation id resolves to
/// an earlier envelope, and correlation/tenant ids are preserved along every
/// derivation path.
#[tokio::test]
async fn causation_chain_and_correlation_are_intact() {
    let world = world(|store| {
        vec![
            Arc::new(SlottingSuggestionAgent::new(store.clone())) as Arc<dyn Agent>,
            Arc::new(FefoReservationAgent::new(store.clone())) as Arc<dyn Agent>,
            Arc::new(StockThresholdAgent::new(store)) as Arc<dyn Agent>,
        ]
    })
    .await;

    let product = seed_product(&world, "P7", |p| {
        p.with_abc_class(AbcClass::A).with_thresholds(8, 2)
    })
    .await;
    let location = seed_location(&world, "A-01", |l| l.with_stats(0.0, 1.0, 10.0)).await;

    receive(&world, product, location, Some(("L1", day(2030, 1, 1))), 10).await;
    world
        .commands
        .place_sales_order(
            &world.ctx,
            vec![OrderLine {
                line: 1,
                product_id: product,
                variant_id: None,
                quantity: 6,
            }],
        )
        .await
        .unwrap();

    // Reservation drops availability to 4 (≤ 8): the threshold agent chains
    // an alert off the reservation event.
    wait_for("cascaded low-stock alert", || async {
        find_event(&world.store, catalog::LOW_STOCK_DETECTED).await
    })
    .await;

    let log = world.store.event_log().await;
    assert!(log.len() >= 5, "expected a real cascade, got {} events", log.len());

    for envelope in &log {
        if let Some(causation_id) = envelope.causation_id() {
            let parents: Vec<&EventEnvelope> =
                log.iter().filter(|e| e.event_id() == causation_id).collect();
            assert_eq!(parents.len(), 1, "causation of {}", envelope.event_id());
            let parent = parents[0];
            assert!(parent.occurred_at() <= envelope.occurred_at());
            assert_eq!(parent.correlation_id(), envelope.correlation_id());
            assert_eq!(parent.tenant_id(), envelope.tenant_id());
        }
    }

    // Eventually every outbox row settles PUBLISHED.
    wait_for("outbox quiescence", || async {
        let entries = world.store.outbox_entries().await;
        entries
            .iter()
            .all(|e| e.status == OutboxStatus::Published)
            .then_some(())
    })
    .await;
}
