use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::{EventItem, NewProduct, Product};
use crate::store::{merge_lines, InventoryError, InventoryStore, Reservation};

/// Product rows and stock mutation over the `products` and
/// `processed_orders` tables.
#[derive(Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn product_from_row(row: &PgRow) -> Result<Product, sqlx::Error> {
    Ok(Product {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        stock: row.try_get("stock")?,
    })
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    async fn create(&self, product: NewProduct) -> Result<Product, InventoryError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO products (name, description, price, stock)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.price)
        .bind(product.stock)
        .fetch_one(&self.pool)
        .await?;

        Ok(Product::from_new(id, product))
    }

    async fn get_by_id(&self, id: i64) -> Result<Product, InventoryError> {
        let row = sqlx::query("SELECT id, name, description, price, stock FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(InventoryError::NotFound(id))?;

        Ok(product_from_row(&row)?)
    }

    async fn list(&self) -> Result<Vec<Product>, InventoryError> {
        let rows = sqlx::query("SELECT id, name, description, price, stock FROM products ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(product_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn update(&self, product: &Product) -> Result<(), InventoryError> {
        let result = sqlx::query(
            "UPDATE products SET name = $1, description = $2, price = $3, stock = $4 WHERE id = $5",
        )
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.price)
        .bind(product.stock)
        .bind(product.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(InventoryError::NotFound(product.id));
        }
        Ok(())
    }

    async fn reserve(&self, order_id: i64, items: &[EventItem]) -> Result<Reservation, InventoryError> {
        let lines = merge_lines(items)?;
        let mut tx = self.pool.begin().await?;

        // The primary key serializes concurrent deliveries of the same order:
        // the second insert waits for the first transaction and then conflicts.
        let claimed = sqlx::query(
            "INSERT INTO processed_orders (order_id) VALUES ($1) ON CONFLICT (order_id) DO NOTHING",
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            tracing::info!(order_id = order_id, "Order already reserved, skipping");
            return Ok(Reservation::AlreadyApplied);
        }

        for (product_id, requested) in lines {
            let remaining: Option<i32> = sqlx::query_scalar(
                "UPDATE products SET stock = stock - $1
                 WHERE id = $2 AND stock >= $1
                 RETURNING stock",
            )
            .bind(requested)
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await?;

            match remaining {
                Some(stock) => {
                    tracing::debug!(
                        order_id = order_id,
                        product_id = product_id,
                        requested = requested,
                        remaining = stock,
                        "Reserved stock"
                    );
                }
                None => {
                    let available: Option<i32> =
                        sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
                            .bind(product_id)
                            .fetch_optional(&mut *tx)
                            .await?;

                    // Dropping `tx` rolls back every earlier line.
                    return Err(match available {
                        None => InventoryError::NotFound(product_id),
                        Some(available) => InventoryError::InsufficientStock {
                            product_id,
                            requested,
                            available,
                        },
                    });
                }
            }
        }

        tx.commit().await?;
        Ok(Reservation::Applied)
    }
}
