//! Shop rows.

use flash_sale_core::order_store::{OrderStoreError, ShopRepository};
use flash_sale_core::types::{Shop, ShopId};
use sqlx::{PgPool, Row};

/// `PostgreSQL` shop repository.
#[derive(Clone)]
pub struct PostgresShopRepository {
    pool: PgPool,
}

impl PostgresShopRepository {
    /// Create a new shop repository.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_shop(row: &sqlx::postgres::PgRow) -> Shop {
        Shop {
            id: ShopId(row.get("id")),
            name: row.get("name"),
            type_id: row.get("type_id"),
            address: row.get("address"),
            avg_price: row.get("avg_price"),
            score: row.get("score"),
            updated_at: row.get("updated_at"),
        }
    }
}

impl ShopRepository for PostgresShopRepository {
    async fn find_shop(&self, id: ShopId) -> Result<Option<Shop>, OrderStoreError> {
        let row = sqlx::query(
            r"
            SELECT id, name, type_id, address, avg_price, score, updated_at
            FROM tb_shop
            WHERE id = $1
            ",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to get shop: {e}")))?;

        Ok(row.as_ref().map(Self::row_to_shop))
    }

    async fn insert_shop(&self, shop: &Shop) -> Result<(), OrderStoreError> {
        sqlx::query(
            r"
            INSERT INTO tb_shop (id, name, type_id, address, avg_price, score, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(shop.id.get())
        .bind(&shop.name)
        .bind(shop.type_id)
        .bind(&shop.address)
        .bind(shop.avg_price)
        .bind(shop.score)
        .bind(shop.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to insert shop: {e}")))?;

        Ok(())
    }

    async fn update_shop(&self, shop: &Shop) -> Result<bool, OrderStoreError> {
        let updated = sqlx::query(
            r"
            UPDATE tb_shop
            SET name = $2, type_id = $3, address = $4, avg_price = $5, score = $6, updated_at = $7
            WHERE id = $1
            ",
        )
        .bind(shop.id.get())
        .bind(&shop.name)
        .bind(shop.type_id)
        .bind(&shop.address)
        .bind(shop.avg_price)
        .bind(shop.score)
        .bind(shop.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to update shop: {e}")))?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn list_shop_ids(
        &self,
        after: Option<ShopId>,
        limit: usize,
    ) -> Result<Vec<ShopId>, OrderStoreError> {
        let limit = i64::try_from(limit)
            .map_err(|_| OrderStoreError::InvalidValue(format!("page size {limit} too large")))?;

        // Keyset pagination on the primary key.
        let ids: Vec<(i64,)> = sqlx::query_as(
            r"
            SELECT id
            FROM tb_shop
            WHERE $1::BIGINT IS NULL OR id > $1
            ORDER BY id
            LIMIT $2
            ",
        )
        .bind(after.map(ShopId::get))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to list shop ids: {e}")))?;

        Ok(ids.into_iter().map(|(id,)| ShopId(id)).collect())
    }
}
