//! HTTP surface over the index: search, suggestions, writes, graph
//! queries, status, and the feedback dashboard.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::extract::Query;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::embedding::{EmbedCache, Embedder};
use crate::error::FlywheelError;
use crate::pipeline::{Pipeline, SharedIndex};
use crate::rewrite;
use crate::score::{self, ScoreRequest, Strictness};
use crate::search::search_notes;
use crate::store::{events, feedback};
use crate::write::{self, WriteContext, WriteGuards};

pub struct AppState {
    pub config: AppConfig,
    pub db: tokio_rusqlite::Connection,
    pub index: SharedIndex,
    pub pipeline: Arc<Pipeline>,
    pub guards: Arc<WriteGuards>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub embed_cache: Arc<EmbedCache>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, embedder: Option<Arc<dyn Embedder>>) -> AppState {
        AppState {
            config: pipeline.config.clone(),
            db: pipeline.db.clone(),
            index: Arc::clone(&pipeline.state),
            guards: Arc::new(WriteGuards::default()),
            embedder,
            embed_cache: Arc::clone(&pipeline.embed_cache),
            pipeline,
        }
    }
}

pub type SharedState = Arc<RwLock<AppState>>;

fn error_response(err: FlywheelError) -> (StatusCode, Json<Value>) {
    match err {
        FlywheelError::WriteConflict { path } => (
            StatusCode::CONFLICT,
            Json(json!({"error": "write_conflict", "path": path})),
        ),
        FlywheelError::Invalid(diagnostic) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "invalid", "diagnostic": diagnostic})),
        ),
        FlywheelError::IndexNotReady { status } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "index_not_ready", "status": status})),
        ),
        FlywheelError::BadPath { path } => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "bad_path", "path": path})),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": other.to_string()})),
        ),
    }
}

async fn status(State(state): State<SharedState>) -> Json<Value> {
    let (status, dirty, parsed, total, entity_count) = {
        let state = state.read().unwrap();
        let index = state.index.read().unwrap();
        let (parsed, total) = index.progress.snapshot();
        (
            index.status.clone(),
            index.dirty,
            parsed,
            total,
            index.entities.len(),
        )
    };
    Json(json!({
        "status": status,
        "stale": dirty,
        "progress": {"parsed": parsed, "total": total},
        "entities": entity_count,
    }))
}

// Fulltext search of all notes, with vector similarity appended
// unless `similarity=false`.
async fn search(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let Some(query) = params.get("query").cloned() else {
        return Json(json!({"query": null, "results": []}));
    };
    let include_similarity = params
        .get("similarity")
        .map(|v| v != "false")
        .unwrap_or(true);
    let limit: usize = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    let (db, index_dir, embedder, embed_cache, stale) = {
        let state = state.read().unwrap();
        (
            state.db.clone(),
            state.config.notes_fts_path(),
            state.embedder.clone(),
            Arc::clone(&state.embed_cache),
            state.index.read().unwrap().dirty,
        )
    };

    let query_for_db = query.clone();
    let results = db
        .call(move |conn| {
            Ok(search_notes(
                &index_dir,
                conn,
                embedder.as_deref(),
                &embed_cache,
                include_similarity,
                &query_for_db,
                limit,
            ))
        })
        .await
        .unwrap_or_default();

    Json(json!({
        "query": query,
        "stale": stale,
        "results": results,
    }))
}

#[derive(Debug, Deserialize)]
struct SuggestRequest {
    content: String,
    path: Option<String>,
    strictness: Option<String>,
    max_suggestions: Option<usize>,
    #[serde(default)]
    detail: bool,
}

// Exploratory suggestion endpoint; defaults to balanced strictness.
async fn suggest(
    State(state): State<SharedState>,
    Json(request): Json<SuggestRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let strictness = match request.strictness.as_deref() {
        Some(raw) => Strictness::parse(raw).ok_or_else(|| {
            error_response(FlywheelError::Invalid(crate::error::Diagnostic::new(
                format!("Unknown strictness {:?}", raw),
            )))
        })?,
        None => Strictness::Balanced,
    };

    let (suggest_index, embedder, embed_cache) = {
        let state = state.read().unwrap();
        let index = state.index.read().unwrap();
        if !index.status.is_ready() {
            return Err(error_response(FlywheelError::IndexNotReady {
                status: index.status.clone(),
            }));
        }
        (
            Arc::clone(&index.suggest),
            state.embedder.clone(),
            Arc::clone(&state.embed_cache),
        )
    };

    let score_request = ScoreRequest {
        content: request.content,
        host_path: request.path.unwrap_or_default(),
        max_suggestions: request.max_suggestions.unwrap_or(3),
        strictness,
    };
    let suggestions = score::suggest(
        &suggest_index,
        embedder.as_deref(),
        &embed_cache,
        &score_request,
    );

    let rendered: Vec<Value> = suggestions
        .iter()
        .map(|s| {
            if request.detail {
                json!({"name": s.name, "path": s.path, "score": s.score, "breakdown": s.breakdown})
            } else {
                json!({"name": s.name, "path": s.path, "score": s.score})
            }
        })
        .collect();
    Ok(Json(json!({"suggestions": rendered})))
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    path: String,
    content: String,
    section: Option<String>,
    strictness: Option<String>,
    max_suggestions: Option<usize>,
}

// Write mutations default to conservative strictness.
async fn write_note(
    State(state): State<SharedState>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let strictness = request
        .strictness
        .as_deref()
        .and_then(Strictness::parse)
        .unwrap_or(Strictness::Conservative);
    let max_suggestions = request.max_suggestions.unwrap_or(3);

    let (config, db, index, guards, embedder, embed_cache) = {
        let state = state.read().unwrap();
        (
            state.config.clone(),
            state.db.clone(),
            Arc::clone(&state.index),
            Arc::clone(&state.guards),
            state.embedder.clone(),
            Arc::clone(&state.embed_cache),
        )
    };
    let ctx = WriteContext {
        config: &config,
        db: &db,
        state: &index,
        embedder: embedder.as_deref(),
        embed_cache: &embed_cache,
        guards: &guards,
    };

    let outcome = match &request.section {
        Some(heading) => {
            write::write_section(
                &ctx,
                &request.path,
                heading,
                &request.content,
                strictness,
                max_suggestions,
            )
            .await
        }
        None => {
            write::append_to_note(
                &ctx,
                &request.path,
                &request.content,
                strictness,
                max_suggestions,
            )
            .await
        }
    };

    match outcome {
        Ok(outcome) => Ok(Json(json!({
            "path": outcome.path,
            "text": outcome.text,
            "applied": outcome.applied,
            "suggestions": outcome.suggestions.iter().map(|s| json!({
                "name": s.name, "path": s.path, "score": s.score,
            })).collect::<Vec<_>>(),
        }))),
        Err(err) => Err(error_response(err)),
    }
}

async fn backlinks(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(path) = params.get("path") else {
        return Err(error_response(FlywheelError::BadPath {
            path: String::new(),
        }));
    };
    let state = state.read().unwrap();
    let index = state.index.read().unwrap();
    let Some(vault) = index.vault.as_ref() else {
        return Err(error_response(FlywheelError::IndexNotReady {
            status: index.status.clone(),
        }));
    };
    let results: Vec<Value> = vault
        .backlinks_for(path)
        .iter()
        .map(|b| json!({"source": b.source_path, "line": b.line_number}))
        .collect();
    Ok(Json(json!({"path": path, "backlinks": results})))
}

// Entity mentions that are not linked yet, per note.
async fn unlinked(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(path) = params.get("path") else {
        return Err(error_response(FlywheelError::BadPath {
            path: String::new(),
        }));
    };

    let (vault_path, entities, suppressed) = {
        let state = state.read().unwrap();
        let index = state.index.read().unwrap();
        if !index.status.is_ready() {
            return Err(error_response(FlywheelError::IndexNotReady {
                status: index.status.clone(),
            }));
        }
        (
            state.config.vault_path.clone(),
            Arc::clone(&index.entities),
            index.suggest.suppressed_for(path),
        )
    };

    let abs = vault_path.join(path);
    let body = std::fs::read_to_string(&abs).unwrap_or_default();
    let mentions = rewrite::find_unlinked_mentions(&body, &entities, &suppressed);
    Ok(Json(json!({"path": path, "mentions": mentions})))
}

// Auto-link every note in place, honoring skipWikilinks.
async fn link_vault(
    State(state): State<SharedState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (config, db, index, guards, embedder, embed_cache) = {
        let state = state.read().unwrap();
        (
            state.config.clone(),
            state.db.clone(),
            Arc::clone(&state.index),
            Arc::clone(&state.guards),
            state.embedder.clone(),
            Arc::clone(&state.embed_cache),
        )
    };
    let ctx = WriteContext {
        config: &config,
        db: &db,
        state: &index,
        embedder: embedder.as_deref(),
        embed_cache: &embed_cache,
        guards: &guards,
    };
    match write::link_vault(&ctx).await {
        Ok(report) => Ok(Json(json!({
            "notes_changed": report.notes_changed,
            "links_added": report.links_added,
            "notes_skipped": report.notes_skipped,
        }))),
        Err(err) => Err(error_response(err)),
    }
}

// Trigger a full reconcile of index state against disk.
async fn reindex(State(state): State<SharedState>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pipeline = {
        let state = state.read().unwrap();
        Arc::clone(&state.pipeline)
    };
    match pipeline.rescan().await {
        Ok(()) => Ok(Json(json!({"success": true}))),
        Err(err) => Err(error_response(FlywheelError::Other(err))),
    }
}

// Accuracy tiers, suppressed entities, and recent pipeline steps.
async fn dashboard(State(state): State<SharedState>) -> Json<Value> {
    let db = {
        let state = state.read().unwrap();
        state.db.clone()
    };
    let payload = db
        .call(|conn| {
            let stats = feedback::global_stats(conn)?;
            let mut tiers = json!({"high": [], "medium": [], "low": []});
            for (entity, s) in &stats {
                let tier = if s.accuracy() >= 0.8 {
                    "high"
                } else if s.accuracy() >= 0.6 {
                    "medium"
                } else {
                    "low"
                };
                tiers[tier].as_array_mut().unwrap().push(json!({
                    "entity": entity,
                    "accuracy": s.accuracy(),
                    "samples": s.total,
                }));
            }
            let suppressed: Vec<String> = feedback::suppressed(conn)?.into_iter().collect();
            let folder_suppressed: Vec<Value> = feedback::folder_suppressed(conn)?
                .into_iter()
                .map(|(folder, entity)| json!({"folder": folder, "entity": entity}))
                .collect();
            let steps: Vec<Value> = events::recent_steps(conn, 50)?
                .into_iter()
                .map(|s| {
                    json!({
                        "batch": s.batch_id,
                        "step": s.step,
                        "duration_ms": s.duration_ms,
                        "outcome": s.outcome,
                        "detail": s.detail,
                    })
                })
                .collect();
            Ok(json!({
                "tiers": tiers,
                "suppressed": suppressed,
                "folder_suppressed": folder_suppressed,
                "recent_steps": steps,
            }))
        })
        .await
        .unwrap_or_else(|err| json!({"error": err.to_string()}));
    Json(payload)
}

#[derive(Debug, Deserialize)]
struct SuppressRequest {
    entity: String,
    #[serde(default)]
    remove: bool,
}

async fn suppress(
    State(state): State<SharedState>,
    Json(request): Json<SuppressRequest>,
) -> Json<Value> {
    let db = {
        let state = state.read().unwrap();
        state.db.clone()
    };
    let entity = request.entity.clone();
    let remove = request.remove;
    let result = db
        .call(move |conn| {
            if remove {
                feedback::unsuppress(conn, &entity)?;
            } else {
                feedback::suppress(conn, &entity)?;
            }
            Ok(())
        })
        .await;
    match result {
        Ok(()) => Json(json!({"success": true})),
        Err(err) => Json(json!({"success": false, "error": err.to_string()})),
    }
}

pub fn app(shared_state: SharedState) -> Router {
    let cors = CorsLayer::permissive();
    Router::new()
        .route("/status", get(status))
        .route("/notes/search", get(search))
        .route("/notes/suggest", post(suggest))
        .route("/notes/write", post(write_note))
        .route("/notes/backlinks", get(backlinks))
        .route("/notes/unlinked", get(unlinked))
        .route("/notes/index", post(reindex))
        .route("/notes/link", post(link_vault))
        .route("/feedback/dashboard", get(dashboard))
        .route("/feedback/suppress", post(suppress))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared_state)
}

// Run the server.
pub async fn serve(host: String, port: String, shared_state: SharedState) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // axum logs rejections from built-in extractors with the `axum::rejection`
                // target, at `TRACE` level. `axum::rejection=trace` enables showing those events
                format!(
                    "{}=debug,tower_http=debug,axum::rejection=trace",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app = app(shared_state);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port))
        .await
        .expect("Failed to bind server address");

    tracing::debug!(
        "Server started. Listening on {}",
        listener.local_addr().expect("No local address")
    );

    axum::serve(listener, app).await.expect("Server failed");
}
