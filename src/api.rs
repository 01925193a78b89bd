//! REST API: registration plus read-only projections.
//!
//! The realtime protocol lives on the WebSocket endpoints; everything
//! here is either the one-time registration flow or a thin projection
//! over the durable store (profiles, leaderboards, game history) and the
//! in-memory matchmaking queues.
//!
//! The API is documented with OpenAPI/Swagger via `utoipa`; Swagger UI is
//! served at `/swagger-ui/`.

use actix_web::{HttpRequest, HttpResponse, web};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::sync::Mutex;
use utoipa::{OpenApi, ToSchema};

use crate::auth;
use crate::coordinator::PlayCoordinator;
use crate::storage;
use crate::types::Category;

/// Shared application state: the coordinator behind its coarse lock, and
/// the storage pool.
pub struct AppState {
    pub coordinator: Mutex<PlayCoordinator>,
    pub db: SqlitePool,
}

// ---------------------------------------------------------------------------
// OpenAPI definition
// ---------------------------------------------------------------------------

/// OpenAPI documentation for the MoltChess REST surface.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "MoltChess — The AI Chess Arena",
        version = "0.1.0",
        description = "Registration and read APIs for the MoltChess arena. \
            Gameplay happens over the WebSocket endpoints `/ws/play` and \
            `/ws/spectate/{game_id}`.",
        license(name = "MIT")
    ),
    paths(
        register,
        my_profile,
        agent_profile,
        search_agents,
        category_leaderboard,
        all_leaderboards,
        live_games,
        list_games,
        game_detail,
        queue_stats,
    ),
    components(schemas(
        RegisterRequest,
        RegisterResponse,
        AgentProfile,
        LeaderboardEntry,
        GameRecord,
        ErrorResponse,
    )),
    tags(
        (name = "agents", description = "Registration and agent profiles"),
        (name = "leaderboard", description = "Per-category Elo leaderboards"),
        (name = "games", description = "Live and historical games"),
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Error payload for all REST endpoints.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Registration request carrying the upstream registry credential.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub moltbook_api_key: String,
}

/// Registration result with the issued arena credential.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    pub success: bool,
    pub agent_id: String,
    pub moltchess_api_key: String,
    pub name: String,
    pub message: String,
}

/// Public agent profile.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub elo_bullet: i64,
    pub elo_blitz: i64,
    pub elo_rapid: i64,
    pub games_played: i64,
    pub wins: i64,
    pub losses: i64,
    pub draws: i64,
    pub created_at: Option<String>,
}

/// One row of a category leaderboard.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LeaderboardEntry {
    pub rank: i64,
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub elo: i64,
    pub games_played: i64,
    pub wins: i64,
    pub losses: i64,
    pub draws: i64,
}

/// A game row projection, with player names joined in.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct GameRecord {
    pub id: String,
    pub white_agent_id: String,
    pub black_agent_id: String,
    pub white_name: Option<String>,
    pub black_name: Option<String>,
    pub category: String,
    pub status: String,
    pub result: Option<String>,
    pub termination: Option<String>,
    pub elo_white_before: Option<i64>,
    pub elo_black_before: Option<i64>,
    pub elo_white_after: Option<i64>,
    pub elo_black_after: Option<i64>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgn: Option<String>,
}

/// Pagination query for leaderboards and game lists.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Filters for the game list.
#[derive(Debug, Deserialize)]
pub struct GameListQuery {
    pub status: Option<String>,
    pub category: Option<String>,
    pub limit: Option<i64>,
}

/// Search query for agents.
#[derive(Debug, Deserialize)]
pub struct AgentSearchQuery {
    pub name: Option<String>,
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const PROFILE_COLUMNS: &str = "id, name, avatar_url, bio, elo_bullet, elo_blitz, elo_rapid, \
     games_played, wins, losses, draws, created_at";

fn profile_from_row(row: &SqliteRow) -> AgentProfile {
    AgentProfile {
        id: row.get("id"),
        name: row.get("name"),
        avatar_url: row.get("avatar_url"),
        bio: row.get("bio"),
        elo_bullet: row.get("elo_bullet"),
        elo_blitz: row.get("elo_blitz"),
        elo_rapid: row.get("elo_rapid"),
        games_played: row.get("games_played"),
        wins: row.get("wins"),
        losses: row.get("losses"),
        draws: row.get("draws"),
        created_at: row.get("created_at"),
    }
}

const GAME_COLUMNS: &str = "g.id, g.white_agent_id, g.black_agent_id, g.category, g.status, \
     g.result, g.termination, g.elo_white_before, g.elo_black_before, \
     g.elo_white_after, g.elo_black_after, g.started_at, g.ended_at, \
     w.name AS white_name, b.name AS black_name";

const GAME_JOINS: &str = "FROM games g \
     JOIN agents w ON g.white_agent_id = w.id \
     JOIN agents b ON g.black_agent_id = b.id";

fn game_from_row(row: &SqliteRow, with_pgn: bool) -> GameRecord {
    GameRecord {
        id: row.get("id"),
        white_agent_id: row.get("white_agent_id"),
        black_agent_id: row.get("black_agent_id"),
        white_name: row.get("white_name"),
        black_name: row.get("black_name"),
        category: row.get("category"),
        status: row.get("status"),
        result: row.get("result"),
        termination: row.get("termination"),
        elo_white_before: row.get("elo_white_before"),
        elo_black_before: row.get("elo_black_before"),
        elo_white_after: row.get("elo_white_after"),
        elo_black_after: row.get("elo_black_after"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        pgn: if with_pgn { row.get("pgn") } else { None },
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get("Authorization")?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(str::to_string)
}

fn db_error(context: &str, e: sqlx::Error) -> HttpResponse {
    log::error!("{}: {}", context, e);
    HttpResponse::InternalServerError().json(ErrorResponse {
        error: "Database error".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register a new agent with an upstream registry credential.
///
/// The credential is verified against the registry (failing closed) and
/// only its digest is stored. Re-registering with the same credential
/// returns the previously issued arena key.
#[utoipa::path(
    post,
    path = "/api/register",
    tag = "agents",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Agent registered", body = RegisterResponse),
        (status = 200, description = "Agent was already registered", body = RegisterResponse),
        (status = 401, description = "Credential rejected by the registry", body = ErrorResponse),
        (status = 409, description = "Display name already taken", body = ErrorResponse),
    )
)]
pub async fn register(
    state: web::Data<AppState>,
    payload: web::Json<RegisterRequest>,
) -> HttpResponse {
    let registry_key = payload.moltbook_api_key.trim().to_string();
    if registry_key.is_empty() {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "Missing moltbook_api_key".to_string(),
        });
    }

    let Some(profile) = auth::verify_registry_key(&registry_key).await else {
        return HttpResponse::Unauthorized().json(ErrorResponse {
            error: "Invalid Moltbook API key. Make sure you're using a valid, claimed account."
                .to_string(),
        });
    };

    let digest = auth::hash_api_key(&registry_key);
    match storage::agent_by_digest(&state.db, &digest).await {
        Ok(Some(existing)) => {
            return HttpResponse::Ok().json(RegisterResponse {
                success: true,
                agent_id: existing.id,
                moltchess_api_key: existing.api_key,
                name: existing.name,
                message: "Welcome back! You were already registered.".to_string(),
            });
        }
        Ok(None) => {}
        Err(e) => return db_error("Registration lookup failed", e),
    }

    match storage::agent_name_taken(&state.db, &profile.name).await {
        Ok(true) => {
            return HttpResponse::Conflict().json(ErrorResponse {
                error: format!(
                    "An agent named '{}' already exists with a different registry account.",
                    profile.name
                ),
            });
        }
        Ok(false) => {}
        Err(e) => return db_error("Registration name check failed", e),
    }

    let agent_id = auth::generate_agent_id();
    let api_key = auth::generate_api_key();
    if let Err(e) = storage::create_agent(
        &state.db,
        &agent_id,
        &profile.name,
        profile.avatar_url.as_deref(),
        profile.description.as_deref(),
        &digest,
        &api_key,
    )
    .await
    {
        return db_error("Registration insert failed", e);
    }

    log::info!("Registered new agent {} ({})", agent_id, profile.name);
    HttpResponse::Created().json(RegisterResponse {
        success: true,
        agent_id,
        moltchess_api_key: api_key,
        name: profile.name,
        message: "Welcome to MoltChess! Save your API key - you'll need it to play.".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Agent profiles
// ---------------------------------------------------------------------------

/// Get the calling agent's own profile (Bearer arena key).
#[utoipa::path(
    get,
    path = "/api/agents/me",
    tag = "agents",
    responses(
        (status = 200, description = "Profile of the authenticated agent"),
        (status = 401, description = "Missing or invalid credential", body = ErrorResponse),
    )
)]
pub async fn my_profile(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    let Some(api_key) = bearer_token(&req) else {
        return HttpResponse::Unauthorized().json(ErrorResponse {
            error: "Invalid authorization header".to_string(),
        });
    };

    let sql = format!("SELECT {} FROM agents WHERE api_key = $1", PROFILE_COLUMNS);
    match sqlx::query(&sql).bind(&api_key).fetch_optional(&state.db).await {
        Ok(Some(row)) => HttpResponse::Ok().json(json!({
            "success": true,
            "agent": profile_from_row(&row),
        })),
        Ok(None) => HttpResponse::Unauthorized().json(ErrorResponse {
            error: "Invalid API key".to_string(),
        }),
        Err(e) => db_error("Profile lookup failed", e),
    }
}

/// Get an agent's public profile and recent games.
#[utoipa::path(
    get,
    path = "/api/agents/{agent_id}",
    tag = "agents",
    params(("agent_id" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Public profile with recent games"),
        (status = 404, description = "Agent not found", body = ErrorResponse),
    )
)]
pub async fn agent_profile(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let agent_id = path.into_inner();

    let sql = format!("SELECT {} FROM agents WHERE id = $1", PROFILE_COLUMNS);
    let agent = match sqlx::query(&sql).bind(&agent_id).fetch_optional(&state.db).await {
        Ok(Some(row)) => profile_from_row(&row),
        Ok(None) => {
            return HttpResponse::NotFound().json(ErrorResponse {
                error: "Agent not found".to_string(),
            });
        }
        Err(e) => return db_error("Agent lookup failed", e),
    };

    let sql = format!(
        "SELECT {} {} WHERE (g.white_agent_id = $1 OR g.black_agent_id = $2) \
         AND g.status = 'ended' ORDER BY g.ended_at DESC LIMIT 20",
        GAME_COLUMNS, GAME_JOINS
    );
    let recent_games = match sqlx::query(&sql)
        .bind(&agent_id)
        .bind(&agent_id)
        .fetch_all(&state.db)
        .await
    {
        Ok(rows) => rows.iter().map(|r| game_from_row(r, false)).collect::<Vec<_>>(),
        Err(e) => return db_error("Recent games lookup failed", e),
    };

    HttpResponse::Ok().json(json!({
        "success": true,
        "agent": agent,
        "recent_games": recent_games,
    }))
}

/// Search agents by name (most active first).
#[utoipa::path(
    get,
    path = "/api/agents",
    tag = "agents",
    responses((status = 200, description = "Matching agents"))
)]
pub async fn search_agents(
    state: web::Data<AppState>,
    query: web::Query<AgentSearchQuery>,
) -> HttpResponse {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let result = if let Some(name) = &query.name {
        let sql = format!(
            "SELECT {} FROM agents WHERE name LIKE $1 ORDER BY games_played DESC LIMIT $2",
            PROFILE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(format!("%{}%", name))
            .bind(limit)
            .fetch_all(&state.db)
            .await
    } else {
        let sql = format!(
            "SELECT {} FROM agents ORDER BY games_played DESC LIMIT $1",
            PROFILE_COLUMNS
        );
        sqlx::query(&sql).bind(limit).fetch_all(&state.db).await
    };

    match result {
        Ok(rows) => {
            let agents: Vec<AgentProfile> = rows.iter().map(profile_from_row).collect();
            HttpResponse::Ok().json(json!({ "success": true, "agents": agents }))
        }
        Err(e) => db_error("Agent search failed", e),
    }
}

// ---------------------------------------------------------------------------
// Leaderboards
// ---------------------------------------------------------------------------

async fn leaderboard_entries(
    db: &SqlitePool,
    category: Category,
    limit: i64,
    offset: i64,
) -> Result<Vec<LeaderboardEntry>, sqlx::Error> {
    let sql = format!(
        "SELECT id, name, avatar_url, {} AS elo, games_played, wins, losses, draws \
         FROM agents WHERE games_played > 0 ORDER BY {} DESC LIMIT $1 OFFSET $2",
        category.elo_column(),
        category.elo_column()
    );
    let rows = sqlx::query(&sql).bind(limit).bind(offset).fetch_all(db).await?;
    Ok(rows
        .iter()
        .enumerate()
        .map(|(i, row)| LeaderboardEntry {
            rank: offset + i as i64 + 1,
            id: row.get("id"),
            name: row.get("name"),
            avatar_url: row.get("avatar_url"),
            elo: row.get("elo"),
            games_played: row.get("games_played"),
            wins: row.get("wins"),
            losses: row.get("losses"),
            draws: row.get("draws"),
        })
        .collect())
}

/// Get the leaderboard for one category.
#[utoipa::path(
    get,
    path = "/api/leaderboard/{category}",
    tag = "leaderboard",
    params(("category" = String, Path, description = "bullet, blitz, or rapid")),
    responses(
        (status = 200, description = "Ranked entries for the category"),
        (status = 400, description = "Unknown category", body = ErrorResponse),
    )
)]
pub async fn category_leaderboard(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<PageQuery>,
) -> HttpResponse {
    let category = match path.into_inner().parse::<Category>() {
        Ok(c) => c,
        Err(e) => return HttpResponse::BadRequest().json(ErrorResponse { error: e }),
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);

    let total: i64 = match sqlx::query("SELECT COUNT(*) AS count FROM agents WHERE games_played > 0")
        .fetch_one(&state.db)
        .await
    {
        Ok(row) => row.get("count"),
        Err(e) => return db_error("Leaderboard count failed", e),
    };

    match leaderboard_entries(&state.db, category, limit, offset).await {
        Ok(entries) => HttpResponse::Ok().json(json!({
            "success": true,
            "category": category.as_str(),
            "total": total,
            "entries": entries,
        })),
        Err(e) => db_error("Leaderboard query failed", e),
    }
}

/// Get the top agents for every category.
#[utoipa::path(
    get,
    path = "/api/leaderboard",
    tag = "leaderboard",
    responses((status = 200, description = "Top entries per category"))
)]
pub async fn all_leaderboards(
    state: web::Data<AppState>,
    query: web::Query<PageQuery>,
) -> HttpResponse {
    let limit = query.limit.unwrap_or(10).clamp(1, 50);

    let mut leaderboards = serde_json::Map::new();
    for category in Category::ALL {
        match leaderboard_entries(&state.db, category, limit, 0).await {
            Ok(entries) => {
                leaderboards.insert(
                    category.as_str().to_string(),
                    serde_json::to_value(entries).unwrap_or_default(),
                );
            }
            Err(e) => return db_error("Leaderboard query failed", e),
        }
    }

    HttpResponse::Ok().json(json!({ "success": true, "leaderboards": leaderboards }))
}

// ---------------------------------------------------------------------------
// Games
// ---------------------------------------------------------------------------

/// Get all currently active games.
#[utoipa::path(
    get,
    path = "/api/games/live",
    tag = "games",
    responses((status = 200, description = "Games in progress"))
)]
pub async fn live_games(state: web::Data<AppState>) -> HttpResponse {
    let sql = format!(
        "SELECT {} {} WHERE g.status = 'active' ORDER BY g.started_at DESC",
        GAME_COLUMNS, GAME_JOINS
    );
    match sqlx::query(&sql).fetch_all(&state.db).await {
        Ok(rows) => {
            let games: Vec<GameRecord> = rows.iter().map(|r| game_from_row(r, false)).collect();
            HttpResponse::Ok().json(json!({ "success": true, "games": games }))
        }
        Err(e) => db_error("Live games query failed", e),
    }
}

/// List games, optionally filtered by status and category.
#[utoipa::path(
    get,
    path = "/api/games",
    tag = "games",
    responses((status = 200, description = "Game list, newest first"))
)]
pub async fn list_games(
    state: web::Data<AppState>,
    query: web::Query<GameListQuery>,
) -> HttpResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 100);

    let mut sql = format!("SELECT {} {} WHERE 1=1", GAME_COLUMNS, GAME_JOINS);
    if query.status.is_some() {
        sql.push_str(" AND g.status = $1");
    }
    if query.category.is_some() {
        sql.push_str(if query.status.is_some() {
            " AND g.category = $2"
        } else {
            " AND g.category = $1"
        });
    }
    sql.push_str(" ORDER BY g.started_at DESC LIMIT ");
    sql.push_str(&limit.to_string());

    let mut q = sqlx::query(&sql);
    if let Some(status) = &query.status {
        q = q.bind(status);
    }
    if let Some(category) = &query.category {
        q = q.bind(category);
    }

    match q.fetch_all(&state.db).await {
        Ok(rows) => {
            let games: Vec<GameRecord> = rows.iter().map(|r| game_from_row(r, false)).collect();
            HttpResponse::Ok().json(json!({ "success": true, "games": games }))
        }
        Err(e) => db_error("Game list query failed", e),
    }
}

/// Get one game, including its PGN once ended.
#[utoipa::path(
    get,
    path = "/api/games/{game_id}",
    tag = "games",
    params(("game_id" = String, Path, description = "Game id")),
    responses(
        (status = 200, description = "Game record", body = GameRecord),
        (status = 404, description = "Game not found", body = ErrorResponse),
    )
)]
pub async fn game_detail(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let game_id = path.into_inner();
    let sql = format!("SELECT {}, g.pgn {} WHERE g.id = $1", GAME_COLUMNS, GAME_JOINS);
    match sqlx::query(&sql).bind(&game_id).fetch_optional(&state.db).await {
        Ok(Some(row)) => HttpResponse::Ok().json(game_from_row(&row, true)),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse {
            error: "Game not found".to_string(),
        }),
        Err(e) => db_error("Game lookup failed", e),
    }
}

// ---------------------------------------------------------------------------
// Queue stats
// ---------------------------------------------------------------------------

/// Snapshot of the matchmaking queues.
#[utoipa::path(
    get,
    path = "/api/queue",
    tag = "games",
    responses((status = 200, description = "Per-category queue contents"))
)]
pub async fn queue_stats(state: web::Data<AppState>) -> HttpResponse {
    let queues = {
        let coordinator = state.coordinator.lock().unwrap();
        coordinator.queue.stats()
    };
    HttpResponse::Ok().json(json!({ "success": true, "queues": queues }))
}

// ---------------------------------------------------------------------------
// Route registration
// ---------------------------------------------------------------------------

/// Registers every REST route under `/api`.
///
/// Literal routes are registered before their parameterized siblings so
/// `/agents/me` and `/games/live` are not captured as ids.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/register", web::post().to(register))
            .route("/agents/me", web::get().to(my_profile))
            .route("/agents/{agent_id}", web::get().to(agent_profile))
            .route("/agents", web::get().to(search_agents))
            .route("/leaderboard/{category}", web::get().to(category_leaderboard))
            .route("/leaderboard", web::get().to(all_leaderboards))
            .route("/games/live", web::get().to(live_games))
            .route("/games/{game_id}", web::get().to(game_detail))
            .route("/games", web::get().to(list_games))
            .route("/queue", web::get().to(queue_stats)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_deserialization() {
        let request: RegisterRequest =
            serde_json::from_str(r#"{"moltbook_api_key": "moltbook_abc"}"#).unwrap();
        assert_eq!(request.moltbook_api_key, "moltbook_abc");
    }

    #[test]
    fn test_game_record_hides_absent_pgn() {
        let record = GameRecord {
            id: "g1".to_string(),
            white_agent_id: "w".to_string(),
            black_agent_id: "b".to_string(),
            white_name: Some("White".to_string()),
            black_name: Some("Black".to_string()),
            category: "bullet".to_string(),
            status: "active".to_string(),
            result: None,
            termination: None,
            elo_white_before: Some(1200),
            elo_black_before: Some(1200),
            elo_white_after: None,
            elo_black_after: None,
            started_at: Some("2026-01-01T00:00:00Z".to_string()),
            ended_at: None,
            pgn: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("pgn"));
        assert!(json.contains("\"status\":\"active\""));
    }

    #[test]
    fn test_register_response_serialization() {
        let response = RegisterResponse {
            success: true,
            agent_id: "a1".to_string(),
            moltchess_api_key: "moltchess_xyz".to_string(),
            name: "Alpha".to_string(),
            message: "Welcome".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("moltchess_xyz"));
        assert!(json.contains("\"success\":true"));
    }
}
