use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use skaldi_core::error::ApiError;
use skaldi_core::types::Track;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::broadcast::Broadcaster;
use crate::error::AppError;
use crate::state::AppState;

const INDEX_HTML: &str = include_str!("../assets/index.html");

pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
const SEARCH_RESULT_LIMIT: usize = 5;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/events", get(sse_events))
        .route("/queue", post(enqueue_url))
        .route("/queue/{index}", delete(remove_at_index))
        .route("/playback", post(playback_action))
        // The file cap is enforced while streaming so the reply is a clean
        // 400 instead of a generic 413; the outer limit only bounds
        // multipart framing overhead.
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::max(
                MAX_UPLOAD_BYTES as usize + 1024 * 1024,
            )),
        )
        .route("/search", get(search))
        .route("/suggest", get(suggest))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct QueueRequest {
    #[serde(default)]
    url: String,
}

#[derive(Serialize)]
struct QueueResponse {
    status: &'static str,
    count: usize,
    tracks: Vec<Track>,
}

async fn enqueue_url(
    State(state): State<AppState>,
    Json(body): Json<QueueRequest>,
) -> Result<(StatusCode, Json<QueueResponse>), AppError> {
    if body.url.trim().is_empty() {
        return Err(ApiError::InvalidArgument("url is required".into()).into());
    }

    let tracks = state.resolver.resolve(&body.url).await.map_err(|e| {
        error!(url = %body.url, error = %e, "failed to resolve url");
        ApiError::Internal(format!("failed to resolve url: {e}"))
    })?;

    let mut count = 0;
    for track in &tracks {
        let key = if !track.webpage_url.is_empty() {
            track.webpage_url.clone()
        } else {
            track.url.clone()
        };
        if key.is_empty() {
            continue;
        }

        // Metadata first, so the playlist event that follows the loadfile
        // can hydrate the new entry.
        state.player.store_metadata(key.clone(), track.clone());
        match state
            .player
            .exec(json!(["loadfile", key, "append-play"]))
            .await
        {
            Ok(_) => count += 1,
            Err(e) => error!(url = %key, error = %e, "failed to enqueue track"),
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(QueueResponse {
            status: "queued",
            count,
            tracks,
        }),
    ))
}

async fn remove_at_index(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<StatusCode, AppError> {
    let index: usize = index
        .parse()
        .map_err(|_| ApiError::InvalidArgument(format!("invalid index '{index}'")))?;

    // Checked against the mirror; a race with a concurrent playlist change
    // still surfaces as a player error below.
    if index >= state.player.snapshot().queue.len() {
        return Err(ApiError::NotFound(format!("no queue item at index {index}")).into());
    }

    state
        .player
        .exec(json!(["playlist-remove", index]))
        .await
        .map_err(|e| {
            error!(index, error = %e, "failed to remove queue item");
            ApiError::Internal(format!("remove failed: {e}"))
        })?;

    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PlaybackRequest {
    #[serde(default)]
    action: String,
    #[serde(default)]
    index: Option<i64>,
}

async fn playback_action(
    State(state): State<AppState>,
    Json(body): Json<PlaybackRequest>,
) -> Result<StatusCode, AppError> {
    let result = match body.action.as_str() {
        "pause" => state
            .player
            .exec(json!(["set_property", "pause", true]))
            .await
            .map(|_| ()),
        "resume" => state
            .player
            .exec(json!(["set_property", "pause", false]))
            .await
            .map(|_| ()),
        "skip" => state.player.exec(json!(["playlist-next"])).await.map(|_| ()),
        "previous" => state
            .player
            .exec(json!(["playlist-prev"]))
            .await
            .map(|_| ()),
        "play" => {
            let index = body.index.unwrap_or(0);
            if index < 0 {
                return Err(
                    ApiError::InvalidArgument("index must be non-negative".into()).into(),
                );
            }
            state.player.play_index(index as usize).await
        }
        other => {
            return Err(ApiError::InvalidArgument(format!("unknown action '{other}'")).into());
        }
    };

    result.map_err(|e| {
        error!(action = %body.action, error = %e, "playback action failed");
        AppError::from(ApiError::Internal(format!("playback action failed: {e}")))
    })?;

    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<StatusCode, AppError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidArgument(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field
            .file_name()
            .map(sanitize_filename)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "upload".to_string());

        let dst = upload_path(&original_name);
        let mut file = tokio::fs::File::create(&dst)
            .await
            .map_err(|e| ApiError::Internal(format!("failed to create temp file: {e}")))?;

        let mut written: u64 = 0;
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&dst).await;
                    return Err(
                        ApiError::InvalidArgument(format!("invalid multipart body: {e}")).into(),
                    );
                }
            };

            written += chunk.len() as u64;
            if written > MAX_UPLOAD_BYTES {
                drop(file);
                let _ = tokio::fs::remove_file(&dst).await;
                return Err(
                    ApiError::ResourceExhausted("upload exceeds 100 MiB".into()).into(),
                );
            }

            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&dst).await;
                return Err(ApiError::Internal(format!("failed to write upload: {e}")).into());
            }
        }

        if let Err(e) = file.flush().await {
            drop(file);
            let _ = tokio::fs::remove_file(&dst).await;
            return Err(ApiError::Internal(format!("failed to write upload: {e}")).into());
        }
        drop(file);

        state.player.register_temp_file(dst.clone()).await;
        state.player.store_metadata(
            dst.to_string_lossy().into_owned(),
            Track {
                title: original_name,
                uploader: "Local Upload".to_string(),
                ..Default::default()
            },
        );

        if let Err(e) = state
            .player
            .exec(json!(["loadfile", dst.to_string_lossy(), "append-play"]))
            .await
        {
            error!(path = %dst.display(), error = %e, "failed to enqueue upload");
            state.player.discard_temp_file(&dst).await;
            return Err(ApiError::Internal(format!("failed to enqueue upload: {e}")).into());
        }

        return Ok(StatusCode::ACCEPTED);
    }

    Err(ApiError::InvalidArgument("multipart field 'file' is required".into()).into())
}

fn sanitize_filename(name: &str) -> String {
    std::path::Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn upload_path(original_name: &str) -> PathBuf {
    // Prefer the RAM-backed tmpfs when available.
    let base = if std::path::Path::new("/dev/shm").is_dir() {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir()
    };
    base.join(format!(
        "skaldi_{}_{}",
        uuid::Uuid::new_v4().simple(),
        original_name
    ))
}

// ---------------------------------------------------------------------------
// Search / suggestions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    src: String,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Track>>, AppError> {
    if params.q.trim().is_empty() {
        return Err(ApiError::InvalidArgument("query is required".into()).into());
    }

    let tracks = state
        .resolver
        .search(&params.q, SEARCH_RESULT_LIMIT, &params.src)
        .await
        .map_err(|e| {
            warn!(query = %params.q, error = %e, "search failed");
            ApiError::Internal(format!("search failed: {e}"))
        })?;

    Ok(Json(tracks))
}

#[derive(Deserialize)]
struct SuggestParams {
    #[serde(default)]
    q: String,
}

async fn suggest(
    State(state): State<AppState>,
    Query(params): Query<SuggestParams>,
) -> Result<impl IntoResponse, AppError> {
    if params.q.trim().is_empty() {
        return Err(ApiError::InvalidArgument("query is required".into()).into());
    }

    let suggestions = crate::suggest::fetch_suggestions(&state.http, &params.q)
        .await
        .map_err(|e| {
            warn!(query = %params.q, error = %e, "suggestion fetch failed");
            e
        })?;

    Ok((
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(suggestions),
    ))
}

// ---------------------------------------------------------------------------
// SSE events
// ---------------------------------------------------------------------------

async fn sse_events(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let initial = state.player.snapshot();
    let (id, mut rx) = state.broadcaster.subscribe(initial.clone()).await;
    let guard = SubscriberGuard {
        id,
        broadcaster: Arc::clone(&state.broadcaster),
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        if let Ok(payload) = serde_json::to_string(&initial) {
            yield Ok(Event::default().retry(Duration::from_secs(3)).data(payload));
        }
        while let Some(payload) = rx.recv().await {
            yield Ok(Event::default().data(payload));
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// Unsubscribes when the SSE stream is dropped (client went away).
struct SubscriberGuard {
    id: u64,
    broadcaster: Arc<Broadcaster>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let broadcaster = Arc::clone(&self.broadcaster);
        let id = self.id;
        tokio::spawn(async move {
            broadcaster.unsubscribe(id).await;
        });
    }
}
