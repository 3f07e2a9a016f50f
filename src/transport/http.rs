//! axum surface: the smart HTTP endpoints (dispatched by path suffix so repository names may
//! nest) and the repository REST API.
//!
//! Routes:
//! - `GET    /{*repo}/info/refs?service=...` - reference advertisement
//! - `POST   /{*repo}/git-upload-pack`       - negotiation and pack transfer
//! - `POST   /{*repo}/git-receive-pack`      - push
//! - `POST   /api/repo`                      - create a repository
//! - `GET    /api/repos`                     - list repositories
//! - `DELETE /api/repo/{*name}`              - delete a repository

use std::{future::Future, io::Read, net::SocketAddr, time::Instant};

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::session::SessionDriver;
use crate::{
    protocol::{
        ProtocolError, ProtocolStream, Service, TransportProtocol,
        http::{
            GitEndpoint, InfoRefsParams, extract_repo_path, get_advertisement_content_type,
            get_content_type, is_git_request,
        },
    },
    storage::StorageError,
};

#[derive(Clone)]
pub struct AppState {
    pub driver: SessionDriver,
}

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(driver: SessionDriver, logs: bool) -> Router {
    let router = Router::new()
        .route("/api/repo", post(create_repo))
        .route("/api/repos", get(list_repos))
        .route("/api/repo/{*name}", delete(delete_repo))
        .fallback(handle_git)
        .with_state(AppState { driver });
    if logs {
        router.layer(middleware::from_fn(log_request))
    } else {
        router
    }
}

/// Serves `router` on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, router: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        git = is_git_request(&path),
        "http request"
    );
    response
}

// ---------------------------------------------------------------------------
// Git smart HTTP
// ---------------------------------------------------------------------------

async fn handle_git(
    State(state): State<AppState>,
    Query(params): Query<InfoRefsParams>,
    request: Request,
) -> Result<Response, AppError> {
    let path = request.uri().path().to_string();
    let Some((repo, endpoint)) = extract_repo_path(&path) else {
        return Ok((StatusCode::NOT_FOUND, "not found").into_response());
    };
    let method = request.method().clone();
    match (endpoint, method) {
        (GitEndpoint::InfoRefs, Method::GET) => info_refs(&state, repo, params.service()?).await,
        (GitEndpoint::UploadPack, Method::POST) => {
            let body = read_body(request).await?;
            upload_pack(&state, repo, body).await
        }
        (GitEndpoint::ReceivePack, Method::POST) => {
            let body = read_body(request).await?;
            receive_pack(&state, repo, body).await
        }
        _ => Ok((StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response()),
    }
}

#[instrument(skip(state))]
async fn info_refs(state: &AppState, repo: &str, service: Service) -> Result<Response, AppError> {
    let payload = state
        .driver
        .advertise(repo, service, TransportProtocol::Http)
        .await?;
    Ok(git_response(get_advertisement_content_type(service), Body::from(payload)))
}

#[instrument(skip(state, body), fields(len = body.len()))]
async fn upload_pack(state: &AppState, repo: &str, body: Bytes) -> Result<Response, AppError> {
    let stream = state.driver.upload_pack(repo, body).await?;
    Ok(git_response(
        get_content_type(Service::UploadPack),
        Body::from_stream(stream),
    ))
}

#[instrument(skip(state, body), fields(len = body.len()))]
async fn receive_pack(state: &AppState, repo: &str, body: Bytes) -> Result<Response, AppError> {
    let request: ProtocolStream = Box::pin(futures::stream::iter([Ok::<Bytes, ProtocolError>(body)]));
    let report = state.driver.receive_pack(repo, request).await?;
    Ok(git_response(
        get_content_type(Service::ReceivePack),
        Body::from(report),
    ))
}

fn git_response(content_type: &'static str, body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Whole request body, inflated when the client gzipped it.
async fn read_body(request: Request) -> Result<Bytes, AppError> {
    let gzipped = is_gzip(request.headers());
    let body = to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| ProtocolError::decode(format!("failed to read request body: {e}")))?;
    if !gzipped {
        return Ok(body);
    }
    let mut inflated = Vec::with_capacity(body.len() * 4);
    GzDecoder::new(&body[..])
        .read_to_end(&mut inflated)
        .map_err(|e| ProtocolError::decode(format!("invalid gzip request body: {e}")))?;
    debug!(compressed = body.len(), inflated = inflated.len(), "inflated request body");
    Ok(Bytes::from(inflated))
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"))
}

// ---------------------------------------------------------------------------
// Repository REST API
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRepoRequest {
    pub name: String,
}

async fn create_repo(
    State(state): State<AppState>,
    payload: Result<Json<CreateRepoRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|rejection| {
        warn!(error = %rejection, "malformed create request");
        ProtocolError::invalid_request(rejection.body_text())
    })?;
    let name = state.driver.registry().create(&request.name).await?;
    info!(repo = %name, "repository created");
    Ok((StatusCode::CREATED, "repository created").into_response())
}

async fn list_repos(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    let names = state.driver.registry().list().await?;
    Ok(Json(names.into_iter().map(String::from).collect()))
}

async fn delete_repo(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.driver.registry().delete(&name).await?;
    info!(repo = %name, "repository deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Engine or storage failure rendered as a short plaintext response.
#[derive(Debug)]
pub struct AppError(ProtocolError);

impl AppError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ProtocolError::Storage(err) => match err {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                StorageError::AlreadyExists(_) | StorageError::ReferenceConflict { .. } => {
                    StatusCode::CONFLICT
                }
                StorageError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                StorageError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
                StorageError::Backend(_) | StorageError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ProtocolError::Decode(_)
            | ProtocolError::InvalidService(_)
            | ProtocolError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProtocolError::Io(_) | ProtocolError::Pack(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, %status, "request rejected");
        }
        (status, format!("{}\n", self.0)).into_response()
    }
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        AppError(err)
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError(ProtocolError::Storage(err))
    }
}
