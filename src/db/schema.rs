//! Schema bootstrap
//!
//! Every statement is idempotent so startup can run it unconditionally.

use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    // One row per (trade_id, asset): the allocation race is settled here
    r#"
    CREATE TABLE IF NOT EXISTS escrow_addresses (
        trade_id        TEXT        NOT NULL,
        asset           TEXT        NOT NULL,
        address         TEXT        NOT NULL,
        status          TEXT        NOT NULL,
        received_amount NUMERIC(40, 18),
        tx_hash         TEXT,
        confirmations   INTEGER     NOT NULL DEFAULT 0,
        created_at      TIMESTAMPTZ NOT NULL,
        expires_at      TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (trade_id, asset)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_escrow_addresses_address ON escrow_addresses (address)",
    r#"
    CREATE TABLE IF NOT EXISTS payment_obligations (
        id              TEXT PRIMARY KEY,
        owner_id        TEXT        NOT NULL,
        kind            TEXT        NOT NULL,
        credits         BIGINT,
        trade_id        TEXT,
        expected_amount NUMERIC(40, 18) NOT NULL,
        asset           TEXT        NOT NULL,
        status          TEXT        NOT NULL,
        payment_address TEXT        NOT NULL,
        received_amount NUMERIC(40, 18),
        tx_hash         TEXT,
        confirmed_at    TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_payment_obligations_pending_address
        ON payment_obligations (payment_address) WHERE status = 'pending'
    "#,
    // Idempotency key of transfer events
    r#"
    CREATE TABLE IF NOT EXISTS processed_transfer_events (
        tx_hash       TEXT        NOT NULL,
        address       TEXT        NOT NULL,
        obligation_id TEXT        NOT NULL,
        processed_at  TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (tx_hash, address)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS obligation_discrepancies (
        id            BIGSERIAL PRIMARY KEY,
        obligation_id TEXT        NOT NULL,
        tx_hash       TEXT        NOT NULL,
        address       TEXT        NOT NULL,
        expected      NUMERIC(40, 18) NOT NULL,
        received      NUMERIC(40, 18) NOT NULL,
        delta         NUMERIC(40, 18) NOT NULL,
        recorded_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_discrepancies_obligation ON obligation_discrepancies (obligation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS user_credits (
        user_id    TEXT PRIMARY KEY,
        credits    BIGINT      NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trades (
        id             TEXT PRIMARY KEY,
        buyer_id       TEXT        NOT NULL,
        seller_id      TEXT        NOT NULL,
        asset          TEXT        NOT NULL,
        amount_crypto  NUMERIC(40, 18) NOT NULL,
        amount_fiat    NUMERIC(40, 18),
        status         TEXT        NOT NULL,
        escrow_status  TEXT        NOT NULL,
        escrow_address TEXT,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Create tables and indexes if they do not exist
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = STATEMENTS.len(), "Database schema ready");
    Ok(())
}
