use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::HashMap;

use crate::domain::{NewOrder, Order, OrderCreatedEvent, OrderItem, OrderStatus};
use crate::messaging::ORDER_CREATED_ROUTING_KEY;
use crate::store::{OrderStore, OrderStoreError, OutboxRecord, OutboxStore};

/// Order and outbox persistence over the `orders`, `order_items` and
/// `order_outbox` tables.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_items(&self, order_ids: &[i64]) -> Result<HashMap<i64, Vec<OrderItem>>, OrderStoreError> {
        let rows = sqlx::query(
            "SELECT id, order_id, product_id, quantity
             FROM order_items
             WHERE order_id = ANY($1)
             ORDER BY id",
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut items: HashMap<i64, Vec<OrderItem>> = HashMap::new();
        for row in rows {
            let item = OrderItem {
                id: row.try_get("id")?,
                order_id: row.try_get("order_id")?,
                product_id: row.try_get("product_id")?,
                quantity: row.try_get("quantity")?,
            };
            items.entry(item.order_id).or_default().push(item);
        }
        Ok(items)
    }
}

fn order_from_row(row: &PgRow) -> Result<Order, OrderStoreError> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        status: status
            .parse::<OrderStatus>()
            .map_err(|e| OrderStoreError::CorruptStatus(e.0))?,
        created_at: row.try_get("created_at")?,
        items: Vec::new(),
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxRecord, OrderStoreError> {
    let payload: String = row.try_get("payload")?;
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        routing_key: row.try_get("routing_key")?,
        payload: payload.into_bytes(),
        created_at: row.try_get("created_at")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn create(&self, order: NewOrder, with_outbox: bool) -> Result<Order, OrderStoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO orders (user_id, status) VALUES ($1, $2) RETURNING id, created_at",
        )
        .bind(order.user_id)
        .bind(OrderStatus::Pending.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let order_id: i64 = row.try_get("id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        let mut items = Vec::with_capacity(order.items.len());
        for item in &order.items {
            let item_id: i64 = sqlx::query_scalar(
                "INSERT INTO order_items (order_id, product_id, quantity)
                 VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(order_id)
            .bind(item.product_id)
            .bind(item.quantity)
            .fetch_one(&mut *tx)
            .await?;

            items.push(OrderItem {
                id: item_id,
                order_id,
                product_id: item.product_id,
                quantity: item.quantity,
            });
        }

        let stored = Order {
            id: order_id,
            user_id: order.user_id,
            status: OrderStatus::Pending,
            created_at,
            items,
        };

        if with_outbox {
            let payload = serde_json::to_string(&OrderCreatedEvent::from_order(&stored, created_at))?;
            sqlx::query(
                "INSERT INTO order_outbox (order_id, routing_key, payload, created_at)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(order_id)
            .bind(ORDER_CREATED_ROUTING_KEY)
            .bind(payload)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            order_id = order_id,
            user_id = stored.user_id,
            item_count = stored.items.len(),
            with_outbox = with_outbox,
            "Order committed"
        );

        Ok(stored)
    }

    async fn get_by_id(&self, id: i64) -> Result<Order, OrderStoreError> {
        let row = sqlx::query("SELECT id, user_id, status, created_at FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(OrderStoreError::NotFound(id))?;

        let mut order = order_from_row(&row)?;
        order.items = self.load_items(&[id]).await?.remove(&id).unwrap_or_default();
        Ok(order)
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Order>, OrderStoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, status, created_at FROM orders WHERE user_id = $1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut orders = rows.iter().map(order_from_row).collect::<Result<Vec<_>, _>>()?;
        if orders.is_empty() {
            return Ok(orders);
        }

        let ids: Vec<i64> = orders.iter().map(|o| o.id).collect();
        let mut items = self.load_items(&ids).await?;
        for order in &mut orders {
            order.items = items.remove(&order.id).unwrap_or_default();
        }
        Ok(orders)
    }

    async fn update_status(&self, id: i64, status: OrderStatus) -> Result<(), OrderStoreError> {
        let result = sqlx::query("UPDATE orders SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrderStoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOrderStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OrderStoreError> {
        let rows = sqlx::query(
            "SELECT id, order_id, routing_key, payload, created_at, attempts, last_error
             FROM order_outbox
             WHERE published_at IS NULL AND failed_at IS NULL
             ORDER BY id
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(outbox_from_row).collect()
    }

    async fn mark_published(&self, id: i64) -> Result<(), OrderStoreError> {
        let result = sqlx::query("UPDATE order_outbox SET published_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrderStoreError::OutboxRecordNotFound(id));
        }
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<i32, OrderStoreError> {
        sqlx::query_scalar(
            "UPDATE order_outbox SET attempts = attempts + 1, last_error = $2
             WHERE id = $1
             RETURNING attempts",
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(OrderStoreError::OutboxRecordNotFound(id))
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), OrderStoreError> {
        let result = sqlx::query(
            "UPDATE order_outbox SET failed_at = now(), last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrderStoreError::OutboxRecordNotFound(id));
        }
        Ok(())
    }
}
