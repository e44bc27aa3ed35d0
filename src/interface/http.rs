use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::aggregate::filter_summaries;
use crate::chat::{ConversationSummary, DeliveryStatus, MessageId, NewMessage};
use crate::error::{RealtimeError, StoreError};
use crate::inbox::Inbox;

pub struct ApiState {
    pub inbox: Arc<Inbox>,
    pub tx: broadcast::Sender<Vec<ConversationSummary>>,
}

/// JSON + SSE front end over an [`Inbox`].
pub struct HttpApi {
    state: Arc<ApiState>,
}

impl HttpApi {
    pub fn new(inbox: Arc<Inbox>) -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self {
            state: Arc::new(ApiState { inbox, tx }),
        }
    }

    /// Opens the live conversation list and relays every new snapshot to
    /// connected `/events` clients.
    pub async fn start_feed(&self) -> Result<(), RealtimeError> {
        let tx = self.state.tx.clone();
        self.state
            .inbox
            .on_conversations_changed(Arc::new(move |summaries: &[ConversationSummary]| {
                // No subscribers is fine.
                let _ = tx.send(summaries.to_vec());
            }))
            .await
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/conversations", get(conversations_handler))
            .route("/conversations/:phone/messages", get(messages_handler))
            .route("/messages", post(insert_handler))
            .route("/messages/:id/status", post(status_handler))
            .route("/events", get(events_handler))
            .with_state(self.state.clone())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }
}

/// Store failures as HTTP responses.
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            StoreError::Decode(_) => StatusCode::BAD_GATEWAY,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

async fn conversations_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SearchQuery>,
) -> impl IntoResponse {
    let summaries = state.inbox.conversation_summaries().await;
    Json(filter_summaries(&summaries, &query.q))
}

async fn messages_handler(State(state): State<Arc<ApiState>>, Path(phone): Path<String>) -> impl IntoResponse {
    Json(state.inbox.messages(&phone).await)
}

async fn insert_handler(
    State(state): State<Arc<ApiState>>,
    Json(message): Json<NewMessage>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.inbox.insert_message(message).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: DeliveryStatus,
}

async fn status_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.inbox.mark_status(&MessageId::new(id), body.status).await?;
    Ok(Json(updated))
}

async fn events_handler(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::BoxError>>> {
    info!("New SSE connection established");

    let mut rx = state.tx.subscribe();
    let initial = state.inbox.conversation_summaries().await;

    let stream = async_stream::stream! {
        yield Event::default().event("conversations").json_data(&initial).map_err(Into::into);

        loop {
            match rx.recv().await {
                Ok(summaries) => {
                    yield Event::default().event("conversations").json_data(&summaries).map_err(Into::into);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Only the newest snapshot matters.
                    warn!(skipped, "SSE client lagged behind conversation updates");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
