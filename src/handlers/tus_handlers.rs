//! HTTP handlers for the tus 1.0.0 resumable upload protocol.
//! Request bodies are streamed straight into the upload service; nothing
//! buffers a whole chunk in memory here.

use crate::{
    errors::AppError,
    handlers::tus_headers::*,
    models::{metadata::UploadMetadata, upload::{Concat, Upload}},
    services::hooks::{CreationRequest, RequestedLength},
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::io;

/// `OPTIONS {base}`: advertise protocol version and extensions.
pub async fn options_handler(State(state): State<AppState>) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(TUS_VERSION, HeaderValue::from_static(PROTOCOL_VERSION));
    headers.insert(TUS_EXTENSION, HeaderValue::from_static(SUPPORTED_EXTENSIONS));
    if let Some(max) = state.service.max_size() {
        headers.insert(TUS_MAX_SIZE, HeaderValue::from(max));
    }
    response
}

/// `POST {base}`: create an upload.
pub async fn create_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let concat = match header_str(&headers, UPLOAD_CONCAT)? {
        Some(raw) => parse_concat(raw)?,
        None => Concat::None,
    };

    let length = match (
        header_str(&headers, UPLOAD_LENGTH)?,
        header_str(&headers, UPLOAD_DEFER_LENGTH)?,
    ) {
        _ if matches!(concat, Concat::Final(_)) => RequestedLength::Deferred,
        (Some(_), Some(_)) => {
            return Err(AppError::bad_request(
                "Upload-Length and Upload-Defer-Length are mutually exclusive",
            ));
        }
        (Some(raw), None) => RequestedLength::Declared(parse_length(raw)?),
        (None, Some("1")) => RequestedLength::Deferred,
        (None, Some(other)) => {
            return Err(AppError::bad_request(format!(
                "Upload-Defer-Length must be 1, got `{}`",
                other
            )));
        }
        (None, None) => {
            return Err(AppError::bad_request(
                "Upload-Length or Upload-Defer-Length is required",
            ));
        }
    };

    let metadata = match header_str(&headers, UPLOAD_METADATA)? {
        Some(raw) => UploadMetadata::parse_header(raw)
            .map_err(|err| AppError::bad_request(err.to_string()))?,
        None => UploadMetadata::new(),
    };

    let upload = state
        .service
        .create(CreationRequest {
            length,
            metadata,
            concat,
            headers,
        })
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::CREATED;
    let location = state.upload_url(&upload.id);
    let resp_headers = response.headers_mut();
    resp_headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&location).map_err(|err| AppError::internal(err.to_string()))?,
    );
    resp_headers.insert(UPLOAD_OFFSET, HeaderValue::from(upload.offset));
    insert_expiry(resp_headers, state.service.expires_at(&upload));
    Ok(response)
}

/// `HEAD {base}{id}`: report offset and length so the client can resume.
pub async fn head_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = ensure_id_safe(&id)?;
    let upload = state.service.head(id).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    set_upload_headers(headers, &upload, &state);
    insert_expiry(headers, state.service.expires_at(&upload));
    Ok(response)
}

/// `PATCH {base}{id}`: append the request body at `Upload-Offset`.
pub async fn patch_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let id = ensure_id_safe(&id)?;

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str())?;
    if content_type != Some(OFFSET_CONTENT_TYPE) {
        return Err(AppError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("Content-Type must be {}", OFFSET_CONTENT_TYPE),
        ));
    }

    let offset = match header_str(&headers, UPLOAD_OFFSET)? {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| AppError::bad_request(format!("invalid Upload-Offset `{}`", raw)))?,
        None => return Err(AppError::bad_request("Upload-Offset is required")),
    };

    let declare_length = match header_str(&headers, UPLOAD_LENGTH)? {
        Some(raw) => Some(parse_length(raw)?),
        None => None,
    };

    let content_length = header_str(&headers, header::CONTENT_LENGTH.as_str())?
        .and_then(|raw| raw.parse::<u64>().ok());
    let payload = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)))
        .boxed();

    let upload = state
        .service
        .append_declaring(id, offset, declare_length, payload, content_length)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let resp_headers = response.headers_mut();
    resp_headers.insert(UPLOAD_OFFSET, HeaderValue::from(upload.offset));
    insert_expiry(resp_headers, state.service.expires_at(&upload));
    Ok(response)
}

/// `DELETE {base}{id}`: terminate the upload.
pub async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = ensure_id_safe(&id)?;
    state.service.terminate(id).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    Ok(response)
}

/// `GET {base}{id}`: download accepted bytes, honouring a single `Range`.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let id = ensure_id_safe(&id)?;
    let range = match header_str(&headers, header::RANGE.as_str())? {
        Some(raw) => Some(parse_range(raw)?),
        None => None,
    };

    let (start, end) = match range {
        Some((start, end)) => (start, end.map(|e| e.saturating_add(1))),
        None => (0, None),
    };
    let (upload, stream) = state.service.read(id, start, end).await.map_err(|err| {
        if range.is_some() && matches!(err, crate::errors::UploadError::InvalidLength(_)) {
            AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, err.to_string())
        } else {
            err.into()
        }
    })?;
    let served_end = end.unwrap_or(upload.offset).min(upload.offset);
    if range.is_some() && start >= served_end {
        return Err(AppError::new(
            StatusCode::RANGE_NOT_SATISFIABLE,
            format!("range starts beyond the {} bytes available", upload.offset),
        ));
    }

    let mut response = Response::new(Body::from_stream(stream));
    let resp_headers = response.headers_mut();
    resp_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(served_end - start),
    );
    let content_type = upload
        .metadata
        .get("filetype")
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    resp_headers.insert(header::CONTENT_TYPE, content_type);
    if let Some(disposition) = upload
        .metadata
        .get("filename")
        .and_then(|name| HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name.replace('"', ""))).ok())
    {
        resp_headers.insert(header::CONTENT_DISPOSITION, disposition);
    }

    if range.is_some() {
        let content_range = format!(
            "bytes {}-{}/{}",
            start,
            served_end.saturating_sub(1),
            upload.offset
        );
        resp_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&content_range)
                .map_err(|err| AppError::internal(err.to_string()))?,
        );
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    } else {
        *response.status_mut() = StatusCode::OK;
    }
    Ok(response)
}

fn set_upload_headers(headers: &mut HeaderMap, upload: &Upload, state: &AppState) {
    headers.insert(UPLOAD_OFFSET, HeaderValue::from(upload.offset));
    match upload.declared_length {
        Some(length) => {
            headers.insert(UPLOAD_LENGTH, HeaderValue::from(length));
        }
        None => {
            headers.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1"));
        }
    }
    if !upload.metadata.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&upload.metadata.to_header()) {
            headers.insert(UPLOAD_METADATA, value);
        }
    }
    match &upload.concat {
        Concat::None => {}
        Concat::Partial => {
            headers.insert(UPLOAD_CONCAT, HeaderValue::from_static("partial"));
        }
        Concat::Final(parts) => {
            let urls = parts
                .iter()
                .map(|id| state.upload_url(id))
                .collect::<Vec<_>>()
                .join(" ");
            if let Ok(value) = HeaderValue::from_str(&format!("final;{}", urls)) {
                headers.insert(UPLOAD_CONCAT, value);
            }
        }
    }
    headers.insert(
        UPLOAD_COMPLETE,
        HeaderValue::from_static(if upload.is_complete() { "true" } else { "false" }),
    );
}

fn insert_expiry(headers: &mut HeaderMap, expires_at: Option<DateTime<Utc>>) {
    if let Some(at) = expires_at {
        if let Ok(value) = HeaderValue::from_str(&http_date(at)) {
            headers.insert(UPLOAD_EXPIRES, value);
        }
    }
}

/// RFC 7231 IMF-fixdate, e.g. `Wed, 25 Jun 2014 16:00:00 GMT`.
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, AppError> {
    match headers.get(name) {
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim()))
            .map_err(|_| AppError::bad_request(format!("header {} is not valid text", name))),
        None => Ok(None),
    }
}

/// Parsed as signed so a negative length reaches the state machine and is
/// rejected there as an invalid length.
fn parse_length(raw: &str) -> Result<i64, AppError> {
    raw.parse::<i64>()
        .map_err(|_| AppError::bad_request(format!("invalid upload length `{}`", raw)))
}

/// `partial` or `final;<url> <url> ...`, where each URL ends in an upload id.
fn parse_concat(raw: &str) -> Result<Concat, AppError> {
    if raw == "partial" {
        return Ok(Concat::Partial);
    }
    let Some(list) = raw.strip_prefix("final;") else {
        return Err(AppError::bad_request(format!(
            "invalid Upload-Concat `{}`",
            raw
        )));
    };
    let parts = list
        .split_whitespace()
        .map(|url| {
            let id = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
            ensure_id_safe(id)
                .map(str::to_string)
                .map_err(|_| AppError::bad_request(format!("invalid partial upload URL `{}`", url)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Concat::Final(parts))
}

/// `bytes=start-end` or `bytes=start-`; `end` is inclusive.
fn parse_range(raw: &str) -> Result<(u64, Option<u64>), AppError> {
    let invalid = || AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, format!("unsupported Range `{}`", raw));
    let ranges = raw.strip_prefix("bytes=").ok_or_else(invalid)?;
    let (start, end) = ranges.split_once('-').ok_or_else(invalid)?;
    let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
    let end = match end.trim() {
        "" => None,
        value => {
            let end = value.parse::<u64>().map_err(|_| invalid())?;
            if end < start {
                return Err(invalid());
            }
            Some(end)
        }
    };
    Ok((start, end))
}

/// Upload ids are 32 lowercase hex characters; anything else cannot exist.
fn ensure_id_safe(id: &str) -> Result<&str, AppError> {
    if id.len() == 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        Ok(id)
    } else {
        Err(AppError::not_found(format!("upload `{}` not found", id)))
    }
}
