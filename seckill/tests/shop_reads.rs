//! Shop read path: membership filter in front of a mutex-guarded cache.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use chrono::Utc;
use flash_sale::bloom::{MembershipFilter, SHOP_FILTER_KEY};
use flash_sale::cache::CacheAside;
use flash_sale::shop::{ShopError, ShopService};
use flash_sale_core::types::{Shop, ShopId};
use flash_sale_testing::{InMemoryKeyValueStore, InMemoryShopRepository};
use std::sync::Arc;
use std::time::Duration;

type Service = ShopService<InMemoryKeyValueStore, InMemoryShopRepository>;

fn shop(id: i64) -> Shop {
    Shop {
        id: ShopId(id),
        name: format!("Noodle Bar #{id}"),
        type_id: 1,
        address: "12 Harbour St".to_string(),
        avg_price: 4_200,
        score: 45,
        updated_at: Utc::now(),
    }
}

fn service(repository: &Arc<InMemoryShopRepository>) -> Arc<Service> {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let filter = MembershipFilter::new(Arc::clone(&kv), SHOP_FILTER_KEY, 10_000, 0.001).unwrap();
    let cache = CacheAside::new(kv).with_ttl(Duration::from_secs(60));
    Arc::new(ShopService::new(filter, cache, Arc::clone(repository)).with_warm_batch(100))
}

#[tokio::test(start_paused = true)]
async fn hot_key_miss_reaches_database_once() {
    let repository = Arc::new(
        InMemoryShopRepository::new()
            .with_latency(Duration::from_millis(40))
            .with_shop(shop(1)),
    );
    let shops = service(&repository);
    shops.warm_filter().await.unwrap();

    let reads = (0..50).map(|_| {
        let shops = Arc::clone(&shops);
        tokio::spawn(async move { shops.read_shop(ShopId(1)).await })
    });
    let results = futures::future::join_all(reads).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap().id, ShopId(1));
    }
    assert_eq!(repository.lookups(), 1);
}

#[tokio::test]
async fn ids_never_created_are_answered_by_the_filter() {
    let repository = Arc::new((1..=250).fold(InMemoryShopRepository::new(), |repo, id| {
        repo.with_shop(shop(id))
    }));
    let shops = service(&repository);

    assert_eq!(shops.warm_filter().await.unwrap(), 250);

    for id in 10_000..10_500 {
        assert_eq!(
            shops.read_shop(ShopId(id)).await,
            Err(ShopError::NotFound(ShopId(id)))
        );
    }
    let reached_database = repository.lookups();

    // At 0.1% false positives, a handful at most get past the filter.
    assert!(reached_database < 10, "{reached_database} lookups reached the database");
}

#[tokio::test]
async fn warmed_shops_are_readable_and_updates_are_visible() {
    let repository = Arc::new(InMemoryShopRepository::new().with_shop(shop(3)));
    let shops = service(&repository);
    shops.warm_filter().await.unwrap();

    assert_eq!(shops.read_shop(ShopId(3)).await.unwrap().score, 45);

    let mut rescored = shop(3);
    rescored.score = 49;
    shops.update_shop(&rescored).await.unwrap();

    assert_eq!(shops.read_shop(ShopId(3)).await.unwrap().score, 49);
    assert_eq!(repository.lookups(), 2);
}

#[tokio::test]
async fn new_shop_is_readable_without_rewarming() {
    let repository = Arc::new(InMemoryShopRepository::new());
    let shops = service(&repository);
    shops.warm_filter().await.unwrap();

    shops.save_shop(&shop(77)).await.unwrap();

    assert_eq!(shops.read_shop(ShopId(77)).await.unwrap().id, ShopId(77));
}
