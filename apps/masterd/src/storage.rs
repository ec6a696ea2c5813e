use anyhow::Context;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

/// Seed value when the tracker table has never been written.
const PERSISTENT_ID_START: u32 = 1;

/// `servers.version` written for our own row.
const SERVER_VERSION: u32 = 3;

pub async fn connect(db_url: &str) -> anyhow::Result<MySqlPool> {
    MySqlPoolOptions::new()
        .max_connections(4)
        .connect(db_url)
        .await
        .context("connecting to the database")
}

/// The servers table is authoritative for our advertised address: make the
/// `master` row reflect this process before anything else talks to us.
pub async fn upsert_master_row(pool: &MySqlPool, ip: &str, port: u16) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO servers (name, ip, port, state, version) \
         VALUES ('master', ?, ?, 0, ?) \
         ON DUPLICATE KEY UPDATE ip = ?, port = ?",
    )
    .bind(ip)
    .bind(port)
    .bind(SERVER_VERSION)
    .bind(ip)
    .bind(port)
    .execute(pool)
    .await
    .context("upserting the master servers row")?;
    Ok(())
}

/// Load the persistent-ID high-water mark, seeding the row on first run.
pub async fn load_persistent_id(pool: &MySqlPool) -> anyhow::Result<u32> {
    let row = sqlx::query("SELECT last_object_id FROM object_id_tracker")
        .fetch_optional(pool)
        .await
        .context("reading object_id_tracker")?;

    match row {
        Some(row) => Ok(row.try_get::<u32, _>("last_object_id")?),
        None => {
            sqlx::query("INSERT INTO object_id_tracker (last_object_id) VALUES (?)")
                .bind(PERSISTENT_ID_START)
                .execute(pool)
                .await
                .context("seeding object_id_tracker")?;
            Ok(PERSISTENT_ID_START)
        }
    }
}

pub async fn save_persistent_id(pool: &MySqlPool, high_water: u32) -> anyhow::Result<()> {
    sqlx::query("UPDATE object_id_tracker SET last_object_id = ?")
        .bind(high_water)
        .execute(pool)
        .await
        .context("saving object_id_tracker")?;
    Ok(())
}

/// Keep-alive: re-read our own row so the connection does not idle out.
pub async fn ping(pool: &MySqlPool) -> anyhow::Result<()> {
    sqlx::query("SELECT ip, port FROM servers WHERE name = 'master'")
        .fetch_optional(pool)
        .await
        .context("pinging the database")?;
    Ok(())
}

/// Admin account bootstrap: elevated gm_level, password already hashed.
pub async fn create_account(pool: &MySqlPool, name: &str, pw_hash: &str) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO accounts (name, password, gm_level) VALUES (?, ?, 9)")
        .bind(name)
        .bind(pw_hash)
        .execute(pool)
        .await
        .context("inserting account")?;
    Ok(())
}
