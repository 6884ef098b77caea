//! File upload boundary.
//!
//! Accepts a multipart body with exactly a `file` and a `session_id` field,
//! attaches the service credential and forwards it upstream. The upstream
//! answer is returned as-is.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use canopy_config::ProtocolClass;
use canopy_observability::RelayMetrics;
use reqwest::multipart::{Form, Part};

use crate::error::{GatewayError, Result};
use crate::server::GatewayState;

#[derive(Debug)]
struct UploadedFile {
    name: String,
    content_type: Option<String>,
    data: Bytes,
}

#[derive(Debug)]
struct UploadRequest {
    file: UploadedFile,
    session_id: String,
}

fn field_error(e: MultipartError, max_bytes: usize) -> GatewayError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        GatewayError::PayloadTooLarge(max_bytes)
    } else {
        GatewayError::InvalidUpload(e.body_text())
    }
}

async fn read_upload(mut multipart: Multipart, max_bytes: usize) -> Result<UploadRequest> {
    let mut file = None;
    let mut session_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| field_error(e, max_bytes))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" if file.is_none() => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(|e| field_error(e, max_bytes))?;
                file = Some(UploadedFile {
                    name: file_name,
                    content_type,
                    data,
                });
            }
            "session_id" if session_id.is_none() => {
                let value = field.text().await.map_err(|e| field_error(e, max_bytes))?;
                session_id = Some(value.trim().to_string());
            }
            "file" | "session_id" => {
                return Err(GatewayError::InvalidUpload(format!("Duplicate field '{}'", name)))
            }
            other => {
                return Err(GatewayError::InvalidUpload(format!("Unexpected field '{}'", other)))
            }
        }
    }

    let file = file.ok_or_else(|| GatewayError::InvalidUpload("Missing field 'file'".to_string()))?;
    let session_id = session_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::InvalidUpload("Missing field 'session_id'".to_string()))?;
    Ok(UploadRequest { file, session_id })
}

pub async fn upload(
    State(state): State<Arc<GatewayState>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Response> {
    let upload = &state.config.upload;
    let credential = upload.auth.header()?;

    let multipart = multipart.map_err(|e| GatewayError::InvalidUpload(e.body_text()))?;
    let request = read_upload(multipart, upload.max_bytes).await?;
    tracing::info!(
        session_id = %request.session_id,
        file = %request.file.name,
        bytes = request.file.data.len(),
        "Forwarding upload"
    );

    let mut part = Part::bytes(request.file.data.to_vec()).file_name(request.file.name);
    if let Some(content_type) = &request.file.content_type {
        part = part
            .mime_str(content_type)
            .map_err(|e| GatewayError::InvalidUpload(format!("Invalid content type: {}", e)))?;
    }
    let form = Form::new()
        .text("session_id", request.session_id)
        .part("file", part);

    let url = state.upstream.http_url(&upload.target_path);
    let mut outbound = state.http.post(&url).multipart(form);
    if let Some((name, value)) = credential {
        outbound = outbound.header(name, value);
    }

    let response = outbound.send().await.map_err(|e| {
        RelayMetrics::upstream_failure(ProtocolClass::Passthrough.as_str());
        GatewayError::UpstreamUnavailable(format!("{}: {}", url, e))
    })?;

    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let body = response
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("{}: {}", url, e)))?;

    let mut reply = Response::new(Body::from(body));
    *reply.status_mut() = status;
    if let Some(content_type) = content_type {
        reply.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    Ok(reply)
}
