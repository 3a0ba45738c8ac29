//! End-to-end tests of the purchase pipeline over the in-memory doubles.
//!
//! Purchase attempts go through admission and the order bus; a spawned
//! consumer persists them into the in-memory order store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::Duration as ChronoDuration;
use flash_sale::purchase::{DenialReason, PurchaseError, PurchaseService};
use flash_sale::queue::{OrderConsumer, OrderProducer};
use flash_sale_core::environment::Clock;
use flash_sale_core::order_bus::OrderBus;
use flash_sale_core::retry::RetryPolicy;
use flash_sale_core::types::{OrderId, OrderMessage, SaleWindow, UserId, Voucher, VoucherId};
use flash_sale_testing::properties::{purchase_attempts, stock_levels};
use flash_sale_testing::{
    FixedClock, InMemoryDeadLetters, InMemoryKeyValueStore, InMemoryOrderBus, InMemoryOrderStore,
    init_test_tracing, test_clock,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const VOUCHER: VoucherId = VoucherId(1);

// ============================================================================
// Test Fixtures
// ============================================================================

struct Pipeline {
    kv: Arc<InMemoryKeyValueStore>,
    bus: Arc<InMemoryOrderBus>,
    store: Arc<InMemoryOrderStore>,
    dead_letters: Arc<InMemoryDeadLetters>,
    service: Arc<PurchaseService<InMemoryKeyValueStore, FixedClock>>,
    shutdown: broadcast::Sender<()>,
}

fn producer(bus: &Arc<InMemoryOrderBus>) -> OrderProducer {
    OrderProducer::new(Arc::clone(bus) as Arc<dyn OrderBus>)
        .with_policy(RetryPolicy::fixed(3, Duration::ZERO))
}

async fn pipeline(stock: u32) -> Pipeline {
    init_test_tracing();

    let kv = Arc::new(InMemoryKeyValueStore::new());
    let bus = Arc::new(InMemoryOrderBus::new());
    let store = Arc::new(InMemoryOrderStore::new().with_voucher(VOUCHER, i64::from(stock)));
    let clock = Arc::new(test_clock());
    let service = PurchaseService::new(Arc::clone(&kv), producer(&bus), Arc::clone(&clock));

    let now = clock.now();
    service
        .register_voucher(&Voucher {
            id: VOUCHER,
            stock,
            window: SaleWindow::new(now - ChronoDuration::minutes(1), now + ChronoDuration::hours(1)),
        })
        .await
        .unwrap();

    let (shutdown, _) = broadcast::channel(1);
    Pipeline {
        kv,
        bus,
        store,
        dead_letters: Arc::new(InMemoryDeadLetters::new()),
        service: Arc::new(service),
        shutdown,
    }
}

impl Pipeline {
    fn start_consumer(&self) -> JoinHandle<()> {
        OrderConsumer::new(
            Arc::clone(&self.bus) as Arc<dyn OrderBus>,
            producer(&self.bus),
            Arc::clone(&self.store),
            Arc::clone(&self.dead_letters),
            test_clock(),
            self.shutdown.subscribe(),
        )
        .spawn()
    }

    async fn stop(&self, consumer: JoinHandle<()>) {
        self.shutdown.send(()).unwrap();
        consumer.await.unwrap();
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5 seconds");
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_unit_goes_to_exactly_one_of_two_buyers() {
    let p = pipeline(1).await;

    let attempts = [UserId(1), UserId(2)].map(|user| {
        let service = Arc::clone(&p.service);
        tokio::spawn(async move { service.try_purchase(VOUCHER, user).await })
    });
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.contains(&Err(PurchaseError::Denied(DenialReason::StockExhausted))));
    assert_eq!(p.service.admission().remaining_stock(VOUCHER).await.unwrap(), Some(0));
    assert_eq!(p.bus.published().len(), 1);
}

#[tokio::test]
async fn same_user_cannot_buy_twice() {
    let p = pipeline(10).await;

    assert!(p.service.try_purchase(VOUCHER, UserId(7)).await.is_ok());
    assert_eq!(
        p.service.try_purchase(VOUCHER, UserId(7)).await,
        Err(PurchaseError::Denied(DenialReason::DuplicateUser))
    );
    assert_eq!(p.service.admission().remaining_stock(VOUCHER).await.unwrap(), Some(9));
}

#[tokio::test]
async fn order_ids_are_unique_and_increasing() {
    let p = pipeline(100).await;

    let mut ids = Vec::new();
    for user in 1..=20 {
        ids.push(p.service.try_purchase(VOUCHER, UserId(user)).await.unwrap());
    }

    let distinct: HashSet<OrderId> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), ids.len());
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn unavailable_store_is_reported_not_denied() {
    let p = pipeline(10).await;
    p.kv.set_unavailable(true);

    assert!(matches!(
        p.service.try_purchase(VOUCHER, UserId(7)).await,
        Err(PurchaseError::Unavailable(_))
    ));
    assert!(p.bus.published().is_empty());
}

#[tokio::test]
async fn publish_error_after_enqueue_does_not_release_the_unit() {
    let p = pipeline(1).await;
    p.bus.lose_next_publish_acks(3);

    let unconfirmed = p.service.try_purchase(VOUCHER, UserId(7)).await;
    let Err(PurchaseError::Unconfirmed(order_id)) = unconfirmed else {
        panic!("expected an unconfirmed order, got {unconfirmed:?}");
    };
    assert_eq!(
        p.service.try_purchase(VOUCHER, UserId(8)).await,
        Err(PurchaseError::Denied(DenialReason::StockExhausted))
    );
    assert_eq!(p.service.admission().remaining_stock(VOUCHER).await.unwrap(), Some(0));

    let consumer = p.start_consumer();
    eventually(|| p.bus.pending() == 0 && p.bus.acknowledged() == 3).await;
    p.stop(consumer).await;

    let orders = p.store.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!((orders[0].id, orders[0].user_id), (order_id, UserId(7)));
    assert_eq!(p.store.stock(VOUCHER), Some(0));
}

#[tokio::test]
async fn rejected_publish_puts_the_unit_back_on_sale() {
    let p = pipeline(1).await;
    p.bus.reject_next_publishes(3);

    assert!(matches!(
        p.service.try_purchase(VOUCHER, UserId(7)).await,
        Err(PurchaseError::Unavailable(_))
    ));
    assert!(p.bus.published().is_empty());
    assert!(p.service.try_purchase(VOUCHER, UserId(8)).await.is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn concurrent_attempts_never_oversell(
        stock in stock_levels(20),
        users in purchase_attempts(15, 60),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let p = pipeline(stock).await;

            let attempts = users.iter().map(|user| {
                let service = Arc::clone(&p.service);
                let user = UserId(*user);
                tokio::spawn(async move { (user, service.try_purchase(VOUCHER, user).await) })
            });
            let results: Vec<_> = futures::future::join_all(attempts)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();

            let winners: Vec<UserId> = results
                .iter()
                .filter(|(_, result)| result.is_ok())
                .map(|(user, _)| *user)
                .collect();
            let distinct_winners: HashSet<UserId> = winners.iter().copied().collect();
            let distinct_users: HashSet<i64> = users.iter().copied().collect();
            let expected = distinct_users.len().min(stock as usize);

            assert_eq!(winners.len(), distinct_winners.len(), "a user was admitted twice");
            assert_eq!(winners.len(), expected);

            let remaining = p.service.admission().remaining_stock(VOUCHER).await.unwrap();
            assert_eq!(remaining, Some(i64::from(stock) - expected as i64));
            assert_eq!(p.bus.published().len(), expected);
        });
    }
}

// ============================================================================
// Asynchronous persistence
// ============================================================================

#[tokio::test]
async fn admitted_purchases_become_orders() {
    let p = pipeline(3).await;
    let consumer = p.start_consumer();

    let mut order_ids = HashSet::new();
    for user in 1..=5 {
        if let Ok(id) = p.service.try_purchase(VOUCHER, UserId(user)).await {
            order_ids.insert(id);
        }
    }

    eventually(|| p.store.orders().len() == 3 && p.bus.acknowledged() == 3).await;
    p.stop(consumer).await;

    let persisted: HashSet<OrderId> = p.store.orders().iter().map(|o| o.id).collect();
    assert_eq!(persisted, order_ids);
    assert_eq!(p.store.stock(VOUCHER), Some(0));
}

#[tokio::test]
async fn crash_between_decrement_and_insert_is_retried_once() {
    let p = pipeline(10).await;
    p.store.crash_after_decrement(1);
    p.bus
        .publish(&OrderMessage::new(UserId(7), VOUCHER, OrderId(42)))
        .await
        .unwrap();

    let consumer = p.start_consumer();
    eventually(|| p.store.orders().len() == 1).await;
    p.stop(consumer).await;

    assert_eq!(p.store.orders()[0].id, OrderId(42));
    assert_eq!(p.store.stock(VOUCHER), Some(9));
    assert_eq!(p.store.persist_calls(), 2);
    assert!(p.dead_letters.letters().is_empty());
}

#[tokio::test]
async fn message_failing_every_delivery_is_dead_lettered() {
    let p = pipeline(10).await;
    p.store.fail_next_persists(3);
    let message = OrderMessage::new(UserId(7), VOUCHER, OrderId(42));
    p.bus.publish(&message).await.unwrap();

    let consumer = p.start_consumer();
    eventually(|| !p.dead_letters.letters().is_empty()).await;
    p.stop(consumer).await;

    let letters = p.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message.order_id, OrderId(42));
    assert_eq!(letters[0].attempts, 3);
    assert!(p.store.orders().is_empty());
    assert_eq!(p.store.stock(VOUCHER), Some(10));
    assert_eq!(
        p.bus.published(),
        vec![message.clone(), message.next_attempt(), message.next_attempt().next_attempt()]
    );
    assert_eq!(p.bus.pending(), 0);
}
