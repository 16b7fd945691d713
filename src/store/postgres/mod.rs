//! Postgres-backed stores.
//!
//! Both stores share one `PgPool`. Every multi-row write runs inside a
//! single transaction; dropping an uncommitted `sqlx::Transaction` rolls it
//! back, so early returns with `?` never leave partial state behind.

mod inventory_store;
mod order_store;

pub use inventory_store::PostgresInventoryStore;
pub use order_store::PostgresOrderStore;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS products (
        id          BIGSERIAL PRIMARY KEY,
        name        TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        price       DOUBLE PRECISION NOT NULL DEFAULT 0,
        stock       INTEGER NOT NULL CHECK (stock >= 0)
    )",
    "CREATE TABLE IF NOT EXISTS orders (
        id         BIGSERIAL PRIMARY KEY,
        user_id    BIGINT NOT NULL CHECK (user_id > 0),
        status     TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS orders_user_id_idx ON orders (user_id)",
    "CREATE TABLE IF NOT EXISTS order_items (
        id         BIGSERIAL PRIMARY KEY,
        order_id   BIGINT NOT NULL REFERENCES orders (id),
        product_id BIGINT NOT NULL CHECK (product_id > 0),
        quantity   INTEGER NOT NULL CHECK (quantity > 0)
    )",
    "CREATE INDEX IF NOT EXISTS order_items_order_id_idx ON order_items (order_id)",
    "CREATE TABLE IF NOT EXISTS order_outbox (
        id           BIGSERIAL PRIMARY KEY,
        order_id     BIGINT NOT NULL REFERENCES orders (id),
        routing_key  TEXT NOT NULL,
        payload      TEXT NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        attempts     INTEGER NOT NULL DEFAULT 0,
        last_error   TEXT,
        published_at TIMESTAMPTZ,
        failed_at    TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS order_outbox_pending_idx
        ON order_outbox (id) WHERE published_at IS NULL AND failed_at IS NULL",
    "CREATE TABLE IF NOT EXISTS processed_orders (
        order_id     BIGINT PRIMARY KEY,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
];

/// Opens the connection pool described by `config`.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await
}

/// Creates every table the pipeline needs. Safe to run repeatedly.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = SCHEMA.len(), "Database schema is up to date");
    Ok(())
}
