// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! HTTP surface (spec §6) — boundary glue, out of the spec's "core" but
//! still implemented in the teacher's idiom: a hand-decoded `Path` enum
//! (`src/web.rs`'s `Path::decode`) dispatching to handler methods on a
//! shared `Service`-like state struct, ported from the teacher's hyper 0.14
//! surface to hyper 1.x + `hyper-util`.

pub mod websocket;

use crate::clip::ClipService;
use crate::hub::Hub;
use crate::ingest::{ActivationResult, IngestionController};
use crate::json::*;
use crate::media::MediaPipeline;
use crate::metrics::Metrics;
use crate::storage::ObjectStore;
use bytes::Bytes;
use db::{Database, MediaType};
use futures::StreamExt;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, warn};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, std::convert::Infallible>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub struct AppState {
    pub db: Database,
    pub store: Arc<dyn ObjectStore>,
    pub hub: Arc<Hub>,
    pub ingest: Arc<IngestionController>,
    pub clips: Arc<ClipService>,
    pub media: Arc<MediaPipeline>,
    pub metrics: Arc<Metrics>,
    pub api_key: Option<String>,
    pub version: String,
    pub build_time: String,
}

#[derive(Debug, Eq, PartialEq)]
enum Path {
    Activate(String),
    Deactivate(String),
    Sync(String),
    Line(String, String),
    Media(String, String, String),
    WebSocket(String),
    Transcript(String, String),
    Clip(String),
    Trim(String),
    Serve(String, String, String, String),
    Download(String, String, String, String),
    Frame(String, String, String),
    StatusCheck(String),
    HealthCheck,
    Version,
    Metrics,
    NotFound,
}

impl Path {
    fn decode(path: &str) -> Self {
        match path {
            "/healthcheck" => return Path::HealthCheck,
            "/version" => return Path::Version,
            "/metrics" => return Path::Metrics,
            _ => {}
        }
        let path = path.trim_start_matches('/');
        let mut parts = path.splitn(2, '/');
        let channel = match parts.next() {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => return Path::NotFound,
        };
        let rest = parts.next().unwrap_or("");
        match rest {
            "activate" => return Path::Activate(channel),
            "deactivate" => return Path::Deactivate(channel),
            "sync" => return Path::Sync(channel),
            "websocket" => return Path::WebSocket(channel),
            "clip" => return Path::Clip(channel),
            "trim" => return Path::Trim(channel),
            "statuscheck" => return Path::StatusCheck(channel),
            _ => {}
        }
        if let Some(stream_id) = rest.strip_prefix("line/") {
            return Path::Line(channel, stream_id.to_string());
        }
        if let Some(rest) = rest.strip_prefix("media/") {
            let mut it = rest.splitn(2, '/');
            if let (Some(stream_id), Some(id)) = (it.next(), it.next()) {
                return Path::Media(channel, stream_id.to_string(), id.to_string());
            }
            return Path::NotFound;
        }
        if let Some(stream_id) = rest.strip_prefix("transcript/") {
            return Path::Transcript(channel, stream_id.to_string());
        }
        if let Some(rest) = rest.strip_prefix("stream/") {
            let parts: Vec<&str> = rest.splitn(3, '/').collect();
            if let [stream_id, kind, filename] = parts[..] {
                return Path::Serve(channel, stream_id.to_string(), kind.to_string(), filename.to_string());
            }
            return Path::NotFound;
        }
        if let Some(rest) = rest.strip_prefix("download/") {
            let parts: Vec<&str> = rest.splitn(3, '/').collect();
            if let [stream_id, kind, filename] = parts[..] {
                return Path::Download(channel, stream_id.to_string(), kind.to_string(), filename.to_string());
            }
            return Path::NotFound;
        }
        if let Some(rest) = rest.strip_prefix("frame/") {
            let mut it = rest.splitn(2, '/');
            if let (Some(stream_id), Some(filename)) = (it.next(), it.next()) {
                return Path::Frame(channel, stream_id.to_string(), filename.to_string());
            }
            return Path::NotFound;
        }
        Path::NotFound
    }
}

fn plain(status: StatusCode, msg: impl Into<String>) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body(msg.into()))
        .expect("valid response")
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_vec(value).expect("serializable");
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response")
}

/// Maps the gRPC-style [`base::ErrorKind`] taxonomy onto HTTP status codes
/// per spec §7's table.
fn error_response(e: &base::Error) -> Response<BoxBody> {
    use base::ErrorKind::*;
    let status = match e.kind() {
        InvalidArgument => StatusCode::BAD_REQUEST,
        NotFound => StatusCode::NOT_FOUND,
        AlreadyExists => StatusCode::from_u16(208).unwrap(),
        Aborted => StatusCode::CONFLICT,
        FailedPrecondition => StatusCode::CONFLICT,
        Unauthenticated => StatusCode::UNAUTHORIZED,
        PermissionDenied => StatusCode::FORBIDDEN,
        Cancelled => StatusCode::BAD_REQUEST,
        Unimplemented => StatusCode::NOT_IMPLEMENTED,
        // Reserved by `clip::ClipService::create_clip` for "mp4 requires a
        // video stream" (spec §4.G); `/clip` is the only route whose table
        // entry includes 405.
        OutOfRange => StatusCode::METHOD_NOT_ALLOWED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e.chain(), "request failed");
    } else {
        warn!(error = %e, "request rejected");
    }
    plain(status, e.to_string())
}

fn query_params(req: &Request<hyper::body::Incoming>) -> std::collections::HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn check_api_key(state: &AppState, req: &Request<hyper::body::Incoming>) -> Result<(), Response<BoxBody>> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let provided = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(plain(StatusCode::UNAUTHORIZED, "missing or invalid X-API-Key"))
    }
}

async fn read_json_body<T: serde::de::DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, base::Error> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| base::err!(InvalidArgument, base::msg!("reading request body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| base::err!(InvalidArgument, base::msg!("invalid JSON body: {e}")))
}

pub async fn serve(
    state: Arc<AppState>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    if req.method() == Method::OPTIONS {
        return Ok(cors_preflight());
    }

    let path = Path::decode(req.uri().path());
    let response = match &path {
        Path::HealthCheck => plain(StatusCode::OK, "ok"),
        Path::Version => json_response(StatusCode::OK, &serde_json::json!({"version": state.version, "buildTime": state.build_time})),
        Path::Metrics => plain(StatusCode::OK, state.metrics.render()),
        _ => match check_api_key(&state, &req) {
            Err(resp) => resp,
            Ok(()) => dispatch(state.clone(), path, req).await,
        },
    };
    Ok(with_cors(response))
}

async fn dispatch(state: Arc<AppState>, path: Path, req: Request<hyper::body::Incoming>) -> Response<BoxBody> {
    match path {
        Path::Activate(channel) => handle_activate(&state, &channel, &req).await,
        Path::Deactivate(channel) => handle_deactivate(&state, &channel, &req).await,
        Path::Sync(channel) => handle_sync(&state, &channel, req).await,
        Path::Line(channel, stream_id) => handle_line(&state, &channel, &stream_id, req).await,
        Path::Media(channel, stream_id, id) => handle_media(&state, &channel, &stream_id, &id, req).await,
        Path::WebSocket(channel) => websocket::upgrade(state, channel, req).await,
        Path::Transcript(channel, stream_id) => handle_transcript(&state, &channel, &stream_id).await,
        Path::Clip(channel) => handle_clip(&state, &channel, req).await,
        Path::Trim(channel) => handle_trim(&state, &channel, req).await,
        Path::Serve(channel, stream_id, kind, filename) => handle_serve(&state, &channel, &stream_id, &kind, &filename, false).await,
        Path::Download(channel, stream_id, kind, filename) => handle_serve(&state, &channel, &stream_id, &kind, &filename, true).await,
        Path::Frame(channel, stream_id, filename) => handle_serve(&state, &channel, &stream_id, "frame", &filename, false).await,
        Path::StatusCheck(channel) => handle_statuscheck(&state, &channel),
        Path::HealthCheck | Path::Version | Path::Metrics | Path::NotFound => plain(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn handle_activate(state: &AppState, channel: &str, req: &Request<hyper::body::Incoming>) -> Response<BoxBody> {
    let q = query_params(req);
    let (Some(id), Some(title), Some(start_time), Some(media_type)) =
        (q.get("id"), q.get("title"), q.get("startTime"), q.get("mediaType"))
    else {
        return plain(StatusCode::BAD_REQUEST, "missing id/title/startTime/mediaType");
    };
    let media_type = match MediaType::from_str(media_type) {
        Ok(m) => m,
        Err(e) => return error_response(&e),
    };
    match state.ingest.activate(channel, id, title, start_time, media_type).await {
        Ok(ActivationResult::Activated) => plain(StatusCode::OK, "activated"),
        Ok(ActivationResult::AlreadyReported) => plain(StatusCode::from_u16(208).unwrap(), "already reported"),
        Err(e) => error_response(&e),
    }
}

async fn handle_deactivate(state: &AppState, channel: &str, req: &Request<hyper::body::Incoming>) -> Response<BoxBody> {
    let q = query_params(req);
    let Some(id) = q.get("id") else {
        return plain(StatusCode::BAD_REQUEST, "missing id");
    };
    match state.ingest.deactivate(channel, id).await {
        Ok(ActivationResult::Activated) => plain(StatusCode::OK, "deactivated"),
        Ok(ActivationResult::AlreadyReported) => plain(StatusCode::from_u16(208).unwrap(), "already reported"),
        Err(e) => error_response(&e),
    }
}

async fn handle_sync(state: &AppState, channel: &str, req: Request<hyper::body::Incoming>) -> Response<BoxBody> {
    let body: SyncRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(&e),
    };
    let upload_time_ms = jiff::Timestamp::now().as_millisecond();
    let lines: Vec<Line> = body.transcript.into_iter().map(LineRequest::into_line).collect();
    match state
        .ingest
        .full_sync(channel, &body.stream_id, &body.title, &body.start_time, body.is_live, body.media_type, lines, upload_time_ms)
        .await
    {
        Ok(()) => plain(StatusCode::OK, "synced"),
        Err(e) => error_response(&e),
    }
}

async fn handle_line(state: &AppState, channel: &str, stream_id: &str, req: Request<hyper::body::Incoming>) -> Response<BoxBody> {
    let body: LineRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(&e),
    };
    let upload_time_ms = jiff::Timestamp::now().as_millisecond();
    let line = body.into_line();
    match state.ingest.append_line(channel, stream_id, line, upload_time_ms).await {
        Ok(()) => plain(StatusCode::OK, "appended"),
        Err(e) => error_response(&e),
    }
}

/// Upload is `multipart/form-data` with a single `file` field (spec §6's
/// route table); `multer` streams the field body straight into the media
/// pipeline without buffering the whole upload in memory.
async fn handle_media(
    state: &AppState,
    channel: &str,
    stream_id: &str,
    id: &str,
    req: Request<hyper::body::Incoming>,
) -> Response<BoxBody> {
    let line_id: i32 = match id.parse() {
        Ok(v) => v,
        Err(_) => return plain(StatusCode::BAD_REQUEST, "invalid line id"),
    };
    let content_type = match req.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(ct) => ct.to_string(),
        None => return plain(StatusCode::BAD_REQUEST, "expected multipart/form-data"),
    };
    let boundary = match multer::parse_boundary(&content_type) {
        Ok(b) => b,
        Err(_) => return plain(StatusCode::BAD_REQUEST, "expected multipart/form-data"),
    };
    let body_stream = http_body_util::BodyStream::new(req.into_body()).map(|r| {
        r.map(|frame| frame.into_data().unwrap_or_default())
            .map_err(std::io::Error::other)
    });
    let mut multipart = multer::Multipart::new(body_stream, boundary);
    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => break field,
            Ok(Some(_)) => continue,
            Ok(None) => return plain(StatusCode::BAD_REQUEST, "missing file field"),
            Err(e) => return plain(StatusCode::BAD_REQUEST, e.to_string()),
        }
    };
    let stream = field.map(|r| r.map_err(std::io::Error::other));
    // `ingest_chunk` only verifies the stream and persists the raw upload
    // inline; transcode/upload/commit/broadcast continue on a task detached
    // from this request (see `media` module docs), so this response does
    // not wait for the commit to finish.
    match state.media.clone().ingest_chunk(channel, stream_id, line_id, Box::pin(stream)).await {
        Ok(()) => {
            state.metrics.on_media_chunk();
            plain(StatusCode::OK, "accepted")
        }
        Err(e) => error_response(&e),
    }
}

async fn handle_transcript(state: &AppState, channel: &str, stream_id: &str) -> Response<BoxBody> {
    match state.db.get_transcript(channel, stream_id).await {
        Ok(lines) => {
            let views: Vec<LineView> = lines.iter().map(LineView::from).collect();
            json_response(StatusCode::OK, &views)
        }
        Err(e) => error_response(&e),
    }
}

async fn handle_clip(state: &AppState, channel: &str, req: Request<hyper::body::Incoming>) -> Response<BoxBody> {
    let body: ClipRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(&e),
    };
    match state
        .clips
        .create_clip(channel, &body.stream_id, body.start_line, body.end_line, body.kind)
        .await
    {
        Ok(clip_id) => {
            state.metrics.on_clip();
            json_response(StatusCode::OK, &ClipResponse { clip_id })
        }
        Err(e) => error_response(&e),
    }
}

async fn handle_trim(state: &AppState, channel: &str, req: Request<hyper::body::Incoming>) -> Response<BoxBody> {
    let body: TrimRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(&e),
    };
    match state
        .clips
        .trim_clip(channel, &body.stream_id, &body.clip_id, body.file_format, body.start_sec, body.end_sec)
        .await
    {
        Ok(clip_id) => json_response(StatusCode::OK, &ClipResponse { clip_id }),
        Err(e) => error_response(&e),
    }
}

async fn handle_serve(
    state: &AppState,
    channel: &str,
    stream_id: &str,
    kind: &str,
    filename: &str,
    attachment: bool,
) -> Response<BoxBody> {
    if !state.store.is_local() {
        return plain(StatusCode::NOT_FOUND, "media serving is local-regime only");
    }
    let key = format!("{channel}/{stream_id}/{kind}/{filename}");
    match state.store.get(&key).await {
        Ok(mut stream) => {
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(c) => buf.extend_from_slice(&c),
                    Err(e) => return plain(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                }
            }
            let ext = filename.rsplit('.').next().unwrap_or("");
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, crate::storage::content_type_for_extension(ext));
            if attachment {
                builder = builder.header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\""));
            }
            builder.body(full_body(buf)).expect("valid response")
        }
        Err(e) => {
            let e: base::Error = e.into();
            error_response(&e)
        }
    }
}

fn handle_statuscheck(state: &AppState, channel: &str) -> Response<BoxBody> {
    let viewer_count = state.hub.connection_count(channel) as u64;
    json_response(StatusCode::OK, &StatusCheckResponse { viewer_count })
}

fn with_cors(mut resp: Response<BoxBody>) -> Response<BoxBody> {
    resp.headers_mut().insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, header::HeaderValue::from_static("*"));
    resp
}

fn cors_preflight() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "X-API-Key, Content-Type")
        .body(full_body(Bytes::new()))
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_activate_path() {
        assert_eq!(Path::decode("/radio1/activate"), Path::Activate("radio1".to_string()));
    }

    #[test]
    fn decodes_media_path() {
        assert_eq!(
            Path::decode("/radio1/media/s1/abc"),
            Path::Media("radio1".to_string(), "s1".to_string(), "abc".to_string())
        );
    }

    #[test]
    fn decodes_operational_paths_without_channel() {
        assert_eq!(Path::decode("/healthcheck"), Path::HealthCheck);
        assert_eq!(Path::decode("/metrics"), Path::Metrics);
    }

    #[test]
    fn unknown_path_is_not_found() {
        assert_eq!(Path::decode("/radio1/bogus"), Path::NotFound);
    }
}
