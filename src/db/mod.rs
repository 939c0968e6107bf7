use anyhow::Result;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str, max: Option<u32>, statement_timeout_ms: Option<u64>) -> Result<Db> {
    let timeout_ms = statement_timeout_ms.unwrap_or(5_000);
    let pool = PgPoolOptions::new()
        .max_connections(max.unwrap_or(10))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                let sql = format!("SET statement_timeout = {timeout_ms}");
                sqlx::query(&sql).execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(url)
        .await?;

    Ok(pool)
}

/// Tworzy schemat `tss` i tabele antinuke, jeśli jeszcze ich nie ma.
pub async fn ensure_tables(db: &Db) -> Result<()> {
    const DDL: [&str; 4] = [
        "CREATE SCHEMA IF NOT EXISTS tss",
        r#"CREATE TABLE IF NOT EXISTS tss.antinuke_config (
            guild_id      TEXT PRIMARY KEY,
            enabled       BOOLEAN NOT NULL DEFAULT FALSE,
            owner_id      TEXT,
            logs_channel  TEXT,
            panic_mode    BOOLEAN NOT NULL DEFAULT FALSE,
            created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at    TIMESTAMPTZ NOT NULL DEFAULT now()
        )"#,
        r#"CREATE TABLE IF NOT EXISTS tss.antinuke_actions (
            id             BIGSERIAL PRIMARY KEY,
            guild_id       TEXT NOT NULL,
            action_type    TEXT NOT NULL,
            enabled        BOOLEAN NOT NULL DEFAULT TRUE,
            limit_count    INTEGER NOT NULL DEFAULT 3,
            window_seconds INTEGER NOT NULL DEFAULT 10,
            punishment     TEXT NOT NULL DEFAULT 'ban',
            updated_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (guild_id, action_type)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS tss.antinuke_whitelist (
            id          BIGSERIAL PRIMARY KEY,
            guild_id    TEXT NOT NULL,
            target_id   TEXT NOT NULL,
            target_type TEXT NOT NULL DEFAULT 'user',
            added_by    TEXT,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (guild_id, target_id)
        )"#,
    ];
    for stmt in DDL {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

/* ===========================
   Odczyty (CacheWarmer)
   =========================== */

/// (enabled, owner_id, logs_channel, panic_mode)
pub type ConfigRow = (bool, Option<String>, Option<String>, bool);

/// (action_type, enabled, limit_count, window_seconds, punishment)
pub type ActionRow = (String, bool, i32, i32, String);

pub async fn fetch_antinuke_config(db: &Db, guild_id: &str) -> sqlx::Result<Option<ConfigRow>> {
    sqlx::query_as::<_, ConfigRow>(
        "SELECT enabled, owner_id, logs_channel, panic_mode FROM tss.antinuke_config WHERE guild_id = $1",
    )
    .bind(guild_id)
    .fetch_optional(db)
    .await
}

pub async fn fetch_whitelist(db: &Db, guild_id: &str) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT target_id FROM tss.antinuke_whitelist WHERE guild_id = $1")
            .bind(guild_id)
            .fetch_all(db)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Tylko włączone wiersze.
pub async fn fetch_action_configs(db: &Db, guild_id: &str) -> sqlx::Result<Vec<ActionRow>> {
    sqlx::query_as::<_, ActionRow>(
        r#"SELECT action_type, enabled, limit_count, window_seconds, punishment
           FROM tss.antinuke_actions
           WHERE guild_id = $1 AND enabled = TRUE"#,
    )
    .bind(guild_id)
    .fetch_all(db)
    .await
}

/* ===========================
   Zapisy (panel sterowania)
   =========================== */

pub async fn set_enabled(db: &Db, guild_id: &str, enabled: bool, owner_id: Option<&str>) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO tss.antinuke_config (guild_id, enabled, owner_id) VALUES ($1, $2, $3)
           ON CONFLICT (guild_id) DO UPDATE
           SET enabled = EXCLUDED.enabled,
               owner_id = COALESCE(EXCLUDED.owner_id, tss.antinuke_config.owner_id),
               updated_at = now()"#,
    )
    .bind(guild_id)
    .bind(enabled)
    .bind(owner_id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_panic(db: &Db, guild_id: &str, panic: bool) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO tss.antinuke_config (guild_id, panic_mode) VALUES ($1, $2)
           ON CONFLICT (guild_id) DO UPDATE SET panic_mode = EXCLUDED.panic_mode, updated_at = now()"#,
    )
    .bind(guild_id)
    .bind(panic)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_logs_channel(db: &Db, guild_id: &str, channel_id: Option<&str>) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO tss.antinuke_config (guild_id, logs_channel) VALUES ($1, $2)
           ON CONFLICT (guild_id) DO UPDATE SET logs_channel = EXCLUDED.logs_channel, updated_at = now()"#,
    )
    .bind(guild_id)
    .bind(channel_id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_owner(db: &Db, guild_id: &str, owner_id: &str) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO tss.antinuke_config (guild_id, owner_id) VALUES ($1, $2)
           ON CONFLICT (guild_id) DO UPDATE SET owner_id = EXCLUDED.owner_id, updated_at = now()"#,
    )
    .bind(guild_id)
    .bind(owner_id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn upsert_action_config(
    db: &Db,
    guild_id: &str,
    action_type: &str,
    limit_count: i32,
    window_seconds: i32,
    punishment: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO tss.antinuke_actions (guild_id, action_type, enabled, limit_count, window_seconds, punishment)
           VALUES ($1, $2, TRUE, $3, $4, $5)
           ON CONFLICT (guild_id, action_type) DO UPDATE
           SET enabled = TRUE,
               limit_count = EXCLUDED.limit_count,
               window_seconds = EXCLUDED.window_seconds,
               punishment = EXCLUDED.punishment,
               updated_at = now()"#,
    )
    .bind(guild_id)
    .bind(action_type)
    .bind(limit_count)
    .bind(window_seconds)
    .bind(punishment)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn disable_action(db: &Db, guild_id: &str, action_type: &str) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE tss.antinuke_actions SET enabled = FALSE, updated_at = now() WHERE guild_id = $1 AND action_type = $2",
    )
    .bind(guild_id)
    .bind(action_type)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn add_whitelist(
    db: &Db,
    guild_id: &str,
    target_id: &str,
    target_type: &str,
    added_by: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO tss.antinuke_whitelist (guild_id, target_id, target_type, added_by)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (guild_id, target_id) DO UPDATE
           SET target_type = EXCLUDED.target_type, added_by = EXCLUDED.added_by"#,
    )
    .bind(guild_id)
    .bind(target_id)
    .bind(target_type)
    .bind(added_by)
    .execute(db)
    .await?;
    Ok(())
}

/// Zwraca true, jeśli coś zostało usunięte.
pub async fn remove_whitelist(db: &Db, guild_id: &str, target_id: &str) -> sqlx::Result<bool> {
    let res = sqlx::query("DELETE FROM tss.antinuke_whitelist WHERE guild_id = $1 AND target_id = $2")
        .bind(guild_id)
        .bind(target_id)
        .execute(db)
        .await?;
    Ok(res.rows_affected() > 0)
}
