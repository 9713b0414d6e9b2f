//! Axum JSON API for the programs catalog, subscriptions, mentor chat and
//! admin ingestion.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ospm_core::{
    filter_programs, latest_additions, merge_new_programs, programs_from_drafts, EmailError,
    IdSpaceExhausted, Program, ProgramDraft, ProgramQuery,
};
use ospm_mentor::{
    context_window, mentor_from_config, MentorAgent, MentorConfig, CONTRIBUTION_WORKFLOW_REPLY,
};
use ospm_notify::{
    start_scheduler, subscription_confirmation, DispatchQueue, ReminderConfig, ReminderPipeline,
};
use ospm_storage::{
    CatalogStore, HttpWorkflowTrigger, LedgerStore, StoreLayout, SubscribeOutcome, SubscriptionRegistry,
    TriggerConfig,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ospm-web";

/// Programs offered as chat suggestions when no difficulty filter is given.
pub const DEFAULT_SUGGESTIONS: usize = 5;
pub const LATEST_ADDITIONS: usize = 3;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogStore>,
    pub registry: Arc<SubscriptionRegistry>,
    pub dispatch: DispatchQueue,
    pub subscribe_flow: String,
    pub mentor: Arc<dyn MentorAgent>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    IngestionWriteFailure(String),
}

impl From<EmailError> for ApiError {
    fn from(err: EmailError) -> Self {
        ApiError::InvalidInput(err.to_string())
    }
}

impl From<IdSpaceExhausted> for ApiError {
    fn from(err: IdSpaceExhausted) -> Self {
        ApiError::InvalidInput(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::IngestionWriteFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "status": "error",
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct SubscribeResponse {
    pub status: &'static str,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub difficulty_filter: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub suggested_programs: Vec<Program>,
}

#[derive(Debug, Serialize)]
pub struct UpdateProgramsResponse {
    pub status: &'static str,
    pub total_programs: usize,
}

#[derive(Debug, Deserialize)]
pub struct AddProgramsRequest {
    #[serde(default)]
    pub programs: Vec<ProgramDraft>,
}

#[derive(Debug, Serialize)]
pub struct AddProgramsResponse {
    pub status: &'static str,
    pub programs_added: usize,
    pub duplicates_skipped: usize,
    pub duplicate_names: Vec<String>,
    pub total_programs: usize,
    pub new_program_names: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/programs", get(programs_handler))
        .route("/subscribers", get(subscribers_handler))
        .route("/api/subscribe", post(subscribe_handler))
        .route("/api/agent/chat", post(chat_handler))
        .route("/admin/latest-additions", get(latest_additions_handler))
        .route("/admin/update-programs", post(update_programs_handler))
        .route("/admin/add-programs", post(add_programs_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Wires stores, collaborators and the reminder scheduler from the
/// environment, then serves until Ctrl-C.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("OSPM_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let layout = StoreLayout::from_env();
    let reminders = ReminderConfig::from_env();

    let catalog = Arc::new(CatalogStore::from_layout(&layout));
    let registry = Arc::new(SubscriptionRegistry::load(&layout.subscriptions).await);
    let ledger = LedgerStore::new(&layout.ledger);
    if let Err(err) = ledger.ensure_exists().await {
        warn!("could not create sent-notification ledger: {err:#}");
    }

    let trigger = Arc::new(HttpWorkflowTrigger::new(TriggerConfig::from_env())?);
    let (dispatch, _worker) = DispatchQueue::spawn(trigger);
    let mentor = mentor_from_config(MentorConfig::from_env())?;

    let scheduler = if reminders.enabled {
        let pipeline = ReminderPipeline::new(
            catalog.clone(),
            registry.clone(),
            ledger,
            dispatch.clone(),
            reminders.daily_flow.clone(),
        );
        Some(start_scheduler(Arc::new(pipeline), reminders.interval).await?)
    } else {
        info!("reminder scheduler disabled");
        None
    };

    let state = AppState {
        catalog,
        registry,
        dispatch,
        subscribe_flow: reminders.subscribe_flow,
        mentor,
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving programs API");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn programs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgramQuery>,
) -> Json<Vec<Program>> {
    let programs = state.catalog.load().await;
    Json(filter_programs(&programs, &query))
}

async fn subscribers_handler(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.registry.list().await)
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubscribeRequest>,
) -> Result<Json<SubscribeResponse>, ApiError> {
    let outcome = state.registry.subscribe(&payload.email).await?;
    if let SubscribeOutcome::Subscribed(email) = &outcome {
        info!(email = %email, "new subscriber");
        let request = subscription_confirmation(&state.subscribe_flow, email);
        if let Err(err) = state.dispatch.enqueue(request) {
            warn!(email = %email, "confirmation not queued: {err}");
        }
    }
    Ok(Json(SubscribeResponse {
        status: outcome.status(),
        email: outcome.email().to_string(),
    }))
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(query): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if query.message.trim().is_empty() {
        return Err(ApiError::InvalidInput("Message cannot be empty".to_string()));
    }
    let programs = state.catalog.load().await;

    let reply = match state.mentor.reply(&query.message, context_window(&programs)).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(agent = state.mentor.name(), "mentor unavailable, using canned reply: {err}");
            CONTRIBUTION_WORKFLOW_REPLY.to_string()
        }
    };

    let suggested_programs = match query.difficulty_filter.filter(|d| !d.trim().is_empty()) {
        Some(difficulty) => filter_programs(
            &programs,
            &ProgramQuery {
                difficulty: Some(difficulty),
                tech: None,
            },
        ),
        None => programs.iter().take(DEFAULT_SUGGESTIONS).cloned().collect(),
    };

    Ok(Json(ChatResponse {
        reply,
        suggested_programs,
    }))
}

async fn latest_additions_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Program>> {
    let programs = state.catalog.load().await;
    Json(latest_additions(&programs, LATEST_ADDITIONS))
}

async fn update_programs_handler(
    State(state): State<Arc<AppState>>,
    Json(drafts): Json<Vec<ProgramDraft>>,
) -> Result<Json<UpdateProgramsResponse>, ApiError> {
    let programs = programs_from_drafts(drafts)?;
    state
        .catalog
        .save(&programs)
        .await
        .map_err(|err| ApiError::IngestionWriteFailure(format!("{err:#}")))?;
    info!(total = programs.len(), "catalog replaced");
    Ok(Json(UpdateProgramsResponse {
        status: "success",
        total_programs: programs.len(),
    }))
}

async fn add_programs_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AddProgramsRequest>,
) -> Result<Json<AddProgramsResponse>, ApiError> {
    if payload.programs.is_empty() {
        return Err(ApiError::InvalidInput("No programs provided".to_string()));
    }

    let outcome = state
        .catalog
        .modify(|existing| {
            let outcome = merge_new_programs(existing, payload.programs)?;
            Ok::<_, IdSpaceExhausted>((outcome.catalog.clone(), outcome))
        })
        .await
        .map_err(|err| ApiError::IngestionWriteFailure(format!("{err:#}")))??;

    for name in &outcome.rejected_names {
        info!(name = %name, "skipping duplicate program");
    }

    Ok(Json(AddProgramsResponse {
        status: "success",
        programs_added: outcome.accepted_names.len(),
        duplicates_skipped: outcome.rejected_names.len(),
        duplicate_names: outcome.rejected_names,
        total_programs: outcome.catalog.len(),
        new_program_names: outcome.accepted_names,
    }))
}
