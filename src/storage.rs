//! Durable storage for agents and games.
//!
//! A thin sqlite layer over `sqlx` runtime queries. The store is the
//! single writer for agent rating/count fields and for game rows; all
//! writes originate in the play coordinator's game-start and end-of-game
//! paths. Everything else reads projections.
//!
//! End-of-game persistence is a single transactional batch (game row plus
//! both agent rows). A failed batch is retried a few times and then
//! dropped with an error log — the in-memory state has already been
//! cleaned up by then, and the server must outlive any single game.

use crate::types::{Category, GameResult, Termination};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

/// Attempts for the end-of-game write batch before giving up.
const PERSIST_RETRIES: u32 = 3;

/// Pause between persistence retries.
const PERSIST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Opens (and creates, if missing) the sqlite database.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Creates the schema if it does not exist yet.
pub async fn init_db(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            avatar_url TEXT,
            bio TEXT,
            registry_key_hash TEXT NOT NULL,
            api_key TEXT NOT NULL UNIQUE,
            elo_bullet INTEGER DEFAULT 1200,
            elo_blitz INTEGER DEFAULT 1200,
            elo_rapid INTEGER DEFAULT 1200,
            games_played INTEGER DEFAULT 0,
            wins INTEGER DEFAULT 0,
            losses INTEGER DEFAULT 0,
            draws INTEGER DEFAULT 0,
            loss_streak_bullet INTEGER DEFAULT 0,
            loss_streak_blitz INTEGER DEFAULT 0,
            loss_streak_rapid INTEGER DEFAULT 0,
            last_game_ended_at TEXT,
            cooldown_until TEXT,
            created_at TEXT NOT NULL,
            verified_at TEXT
        )",
        "CREATE TABLE IF NOT EXISTS games (
            id TEXT PRIMARY KEY,
            white_agent_id TEXT NOT NULL,
            black_agent_id TEXT NOT NULL,
            category TEXT NOT NULL,
            status TEXT DEFAULT 'pending',
            result TEXT,
            termination TEXT,
            pgn TEXT,
            elo_white_before INTEGER,
            elo_black_before INTEGER,
            elo_white_after INTEGER,
            elo_black_after INTEGER,
            time_white_remaining REAL,
            time_black_remaining REAL,
            started_at TEXT,
            ended_at TEXT,
            FOREIGN KEY (white_agent_id) REFERENCES agents(id),
            FOREIGN KEY (black_agent_id) REFERENCES agents(id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_games_status ON games(status)",
        "CREATE INDEX IF NOT EXISTS idx_games_category ON games(category)",
        "CREATE INDEX IF NOT EXISTS idx_agents_elo_bullet ON agents(elo_bullet)",
        "CREATE INDEX IF NOT EXISTS idx_agents_elo_blitz ON agents(elo_blitz)",
        "CREATE INDEX IF NOT EXISTS idx_agents_elo_rapid ON agents(elo_rapid)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    log::info!("Database schema initialized");
    Ok(())
}

// ---------------------------------------------------------------------------
// Agent rows
// ---------------------------------------------------------------------------

/// The agent fields needed to run a session.
#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: String,
    pub name: String,
    pub elo_bullet: i64,
    pub elo_blitz: i64,
    pub elo_rapid: i64,
}

impl AgentRow {
    /// The agent's Elo in one category.
    pub fn elo(&self, category: Category) -> i64 {
        match category {
            Category::Bullet => self.elo_bullet,
            Category::Blitz => self.elo_blitz,
            Category::Rapid => self.elo_rapid,
        }
    }

    /// Updates one category's Elo on an in-memory copy (used by the
    /// session registry's cache after a game ends).
    pub fn set_elo(&mut self, category: Category, elo: i64) {
        match category {
            Category::Bullet => self.elo_bullet = elo,
            Category::Blitz => self.elo_blitz = elo,
            Category::Rapid => self.elo_rapid = elo,
        }
    }
}

/// Looks up an agent by its arena api key (session credential).
pub async fn agent_by_api_key(
    pool: &SqlitePool,
    api_key: &str,
) -> Result<Option<AgentRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, elo_bullet, elo_blitz, elo_rapid FROM agents WHERE api_key = $1",
    )
    .bind(api_key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| AgentRow {
        id: r.get("id"),
        name: r.get("name"),
        elo_bullet: r.get("elo_bullet"),
        elo_blitz: r.get("elo_blitz"),
        elo_rapid: r.get("elo_rapid"),
    }))
}

/// A previously registered agent, found by upstream-credential digest.
#[derive(Debug, Clone)]
pub struct ExistingRegistration {
    pub id: String,
    pub name: String,
    pub api_key: String,
}

/// Finds an agent by the digest of its upstream registry credential.
pub async fn agent_by_digest(
    pool: &SqlitePool,
    digest: &str,
) -> Result<Option<ExistingRegistration>, sqlx::Error> {
    let row = sqlx::query("SELECT id, name, api_key FROM agents WHERE registry_key_hash = $1")
        .bind(digest)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| ExistingRegistration {
        id: r.get("id"),
        name: r.get("name"),
        api_key: r.get("api_key"),
    }))
}

/// Whether a display name is already taken.
pub async fn agent_name_taken(pool: &SqlitePool, name: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT id FROM agents WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Inserts a freshly verified agent with starting ratings.
#[allow(clippy::too_many_arguments)]
pub async fn create_agent(
    pool: &SqlitePool,
    id: &str,
    name: &str,
    avatar_url: Option<&str>,
    bio: Option<&str>,
    registry_key_hash: &str,
    api_key: &str,
) -> Result<(), sqlx::Error> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO agents (
            id, name, avatar_url, bio, registry_key_hash, api_key,
            elo_bullet, elo_blitz, elo_rapid, games_played, wins, losses, draws,
            loss_streak_bullet, loss_streak_blitz, loss_streak_rapid,
            created_at, verified_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, 0, 0, 0, 0, 0, $10, $11)",
    )
    .bind(id)
    .bind(name)
    .bind(avatar_url)
    .bind(bio)
    .bind(registry_key_hash)
    .bind(api_key)
    .bind(crate::elo::ELO_STARTING)
    .bind(crate::elo::ELO_STARTING)
    .bind(crate::elo::ELO_STARTING)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reads the current Elo of one agent in one category.
pub async fn category_elo(
    pool: &SqlitePool,
    agent_id: &str,
    category: Category,
) -> Result<i64, sqlx::Error> {
    let sql = format!(
        "SELECT {} AS elo FROM agents WHERE id = $1",
        category.elo_column()
    );
    let row = sqlx::query(&sql).bind(agent_id).fetch_one(pool).await?;
    Ok(row.get("elo"))
}

// ---------------------------------------------------------------------------
// Game rows
// ---------------------------------------------------------------------------

/// Persists a newly matched game as active, with both Elo snapshots.
#[allow(clippy::too_many_arguments)]
pub async fn insert_game_start(
    pool: &SqlitePool,
    game_id: &str,
    white_agent_id: &str,
    black_agent_id: &str,
    category: Category,
    elo_white_before: i64,
    elo_black_before: i64,
    started_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO games (id, white_agent_id, black_agent_id, category, status,
                            elo_white_before, elo_black_before, started_at)
         VALUES ($1, $2, $3, $4, 'active', $5, $6, $7)",
    )
    .bind(game_id)
    .bind(white_agent_id)
    .bind(black_agent_id)
    .bind(category.as_str())
    .bind(elo_white_before)
    .bind(elo_black_before)
    .bind(started_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Per-player half of an end-of-game write batch.
#[derive(Debug, Clone)]
pub struct PlayerOutcome {
    pub agent_id: String,
    pub new_elo: i64,
    pub elo_change: i64,
    pub is_winner: bool,
    pub loss_streak: u32,
    pub cooldown_seconds: u64,
}

/// Everything the end-of-game path writes, in one transaction.
#[derive(Debug, Clone)]
pub struct GameEndBatch {
    pub game_id: String,
    pub category: Category,
    pub result: GameResult,
    pub termination: Termination,
    pub is_draw: bool,
    pub pgn: String,
    pub white: PlayerOutcome,
    pub black: PlayerOutcome,
    pub time_white_remaining: f64,
    pub time_black_remaining: f64,
    pub ended_at: DateTime<Utc>,
}

/// Writes the end-of-game batch: the game row plus both agent rows.
pub async fn persist_game_end(pool: &SqlitePool, batch: &GameEndBatch) -> Result<(), sqlx::Error> {
    let ended_at = batch.ended_at.to_rfc3339();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE games SET
            status = 'ended',
            result = $1,
            termination = $2,
            pgn = $3,
            elo_white_after = $4,
            elo_black_after = $5,
            time_white_remaining = $6,
            time_black_remaining = $7,
            ended_at = $8
         WHERE id = $9",
    )
    .bind(batch.result.as_str())
    .bind(batch.termination.as_str())
    .bind(&batch.pgn)
    .bind(batch.white.new_elo)
    .bind(batch.black.new_elo)
    .bind(batch.time_white_remaining)
    .bind(batch.time_black_remaining)
    .bind(&ended_at)
    .bind(&batch.game_id)
    .execute(&mut *tx)
    .await?;

    for (player, opponent) in [(&batch.white, &batch.black), (&batch.black, &batch.white)] {
        let sql = format!(
            "UPDATE agents SET
                {} = $1,
                games_played = games_played + 1,
                wins = wins + $2,
                losses = losses + $3,
                draws = draws + $4,
                {} = $5,
                last_game_ended_at = $6
             WHERE id = $7",
            batch.category.elo_column(),
            batch.category.loss_streak_column(),
        );
        sqlx::query(&sql)
            .bind(player.new_elo)
            .bind(if player.is_winner { 1 } else { 0 })
            .bind(if opponent.is_winner { 1 } else { 0 })
            .bind(if batch.is_draw { 1 } else { 0 })
            .bind(player.loss_streak as i64)
            .bind(&ended_at)
            .bind(&player.agent_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await
}

/// Best-effort persistence of an end-of-game batch with bounded retries.
///
/// In-memory cleanup has already happened by the time this runs, so a
/// final failure is logged and the result is lost rather than taking the
/// coordinator down with it.
pub async fn persist_game_end_with_retry(pool: SqlitePool, batch: GameEndBatch) {
    for attempt in 1..=PERSIST_RETRIES {
        match persist_game_end(&pool, &batch).await {
            Ok(()) => {
                log::info!(
                    "Game {} persisted: {} by {}",
                    batch.game_id,
                    batch.result.as_str(),
                    batch.termination
                );
                return;
            }
            Err(e) if attempt < PERSIST_RETRIES => {
                log::warn!(
                    "Persisting game {} failed (attempt {}/{}): {}",
                    batch.game_id,
                    attempt,
                    PERSIST_RETRIES,
                    e
                );
                tokio::time::sleep(PERSIST_RETRY_DELAY).await;
            }
            Err(e) => {
                log::error!(
                    "Giving up persisting game {} after {} attempts: {}",
                    batch.game_id,
                    PERSIST_RETRIES,
                    e
                );
            }
        }
    }
}
