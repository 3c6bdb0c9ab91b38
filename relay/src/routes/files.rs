//! `/files/*`: stores sealed [`CipherChunk`] sequences alongside
//! plaintext size/name/mime-type metadata. Chunk payloads are opaque to the
//! relay; only the uploader and the named recipient may fetch them back.

use crate::error::RelayError;
use crate::state::{now_ms, AppContext, StoredFile};
use axum::extract::{Path, State};
use axum::{Extension, Json};
use cipherlink_core::aead::CipherChunk;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadBody {
    pub recipient_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub chunks: Vec<CipherChunk>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadResponse {
    pub file_id: String,
}

pub async fn upload_file(
    State(ctx): State<AppContext>,
    Extension(sender_id): Extension<String>,
    Json(body): Json<FileUploadBody>,
) -> Result<Json<FileUploadResponse>, RelayError> {
    let chunks_json = serde_json::to_string(&body.chunks)
        .map_err(|e| RelayError::Internal(format!("chunk encode: {e}")))?;
    let file_id = Uuid::new_v4().to_string();
    ctx.state.files.lock().unwrap().insert(
        file_id.clone(),
        StoredFile {
            file_id: file_id.clone(),
            sender_id: sender_id.clone(),
            recipient_id: body.recipient_id.clone(),
            file_name: body.file_name,
            file_size: body.file_size,
            mime_type: body.mime_type,
            total_chunks: body.total_chunks,
            chunks_json,
            uploaded_at_ms: now_ms(),
        },
    );
    ctx.audit.file_uploaded(&sender_id, &body.recipient_id, &file_id);
    Ok(Json(FileUploadResponse { file_id }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownloadResponse {
    pub file_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub chunks: Vec<CipherChunk>,
    pub uploaded_at_ms: i64,
}

pub async fn download_file(
    State(ctx): State<AppContext>,
    Extension(self_id): Extension<String>,
    Path(file_id): Path<String>,
) -> Result<Json<FileDownloadResponse>, RelayError> {
    let files = ctx.state.files.lock().unwrap();
    let file = files.get(&file_id).ok_or(RelayError::NotFound)?;
    if file.sender_id != self_id && file.recipient_id != self_id {
        return Err(RelayError::NotFound);
    }
    let chunks: Vec<CipherChunk> = serde_json::from_str(&file.chunks_json)
        .map_err(|e| RelayError::Internal(format!("chunk decode: {e}")))?;

    ctx.audit.file_accessed(&self_id, &file_id);
    Ok(Json(FileDownloadResponse {
        file_id: file.file_id.clone(),
        sender_id: file.sender_id.clone(),
        recipient_id: file.recipient_id.clone(),
        file_name: file.file_name.clone(),
        file_size: file.file_size,
        mime_type: file.mime_type.clone(),
        total_chunks: file.total_chunks,
        chunks,
        uploaded_at_ms: file.uploaded_at_ms,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub file_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub uploaded_at_ms: i64,
}

pub async fn conversation_files(
    State(ctx): State<AppContext>,
    Extension(self_id): Extension<String>,
    Path(peer_id): Path<String>,
) -> Result<Json<Vec<FileSummary>>, RelayError> {
    let files = ctx.state.files.lock().unwrap();
    let mut out: Vec<FileSummary> = files
        .values()
        .filter(|f| {
            (f.sender_id == self_id && f.recipient_id == peer_id)
                || (f.sender_id == peer_id && f.recipient_id == self_id)
        })
        .map(|f| FileSummary {
            file_id: f.file_id.clone(),
            sender_id: f.sender_id.clone(),
            recipient_id: f.recipient_id.clone(),
            file_name: f.file_name.clone(),
            file_size: f.file_size,
            mime_type: f.mime_type.clone(),
            uploaded_at_ms: f.uploaded_at_ms,
        })
        .collect();
    out.sort_by_key(|f| f.uploaded_at_ms);
    Ok(Json(out))
}
