use crate::model::jobs::{ChunkUpload, UploadRequest};
use crate::model::ModelController;
use crate::Result;
use axum::extract::{Multipart, Query, State};
use axum::{routing::{get, post}, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::model::error::Error as ModelError;


pub fn routes(mc: ModelController) -> Router {
	Router::new()
		.route("/health", get(handler_health))
		.route("/upload", post(handler_upload))
		.route("/progress", get(handler_progress))
		.route("/result", get(handler_result))
		.with_state(mc)
}

async fn handler_health() -> Result<Json<Value>> {
	Ok(Json(json!({
		"ok": true,
		"service": "facegroup",
		"version": 1
	})))
}

fn truthy(value: &str) -> bool {
	matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "y")
}

fn parse_u32(field: &str, value: &str) -> Result<u32> {
	let parsed = value
		.trim()
		.parse::<u32>()
		.map_err(|_| ModelError::UploadBadChunkMeta(format!("{} is not a number: {}", field, value)))?;
	Ok(parsed)
}

/// Accepts both upload shapes: a single `chunk` part with its
/// file_name/chunk_index/chunk_total metadata, or whole files under
/// `files`/`images`. Field order within the form does not matter.
async fn handler_upload(State(mc): State<ModelController>, mut multipart: Multipart) -> Result<Json<Value>> {
	let mut request = UploadRequest::default();
	let mut chunk_bytes: Option<Vec<u8>> = None;
	let mut part_file_name: Option<String> = None;
	let mut file_name: Option<String> = None;
	let mut chunk_index: u32 = 0;
	let mut chunk_total: u32 = 1;

	while let Some(field) = multipart.next_field().await.map_err(ModelError::from)? {
		let name = field.name().unwrap_or_default().to_string();
		match name.as_str() {
			"chunk" => {
				part_file_name = field.file_name().map(|f| f.to_string());
				chunk_bytes = Some(field.bytes().await.map_err(ModelError::from)?.to_vec());
			}
			"files" | "images" => {
				let fname = field.file_name().map(|f| f.to_string()).unwrap_or_else(|| "blob.bin".to_string());
				let bytes = field.bytes().await.map_err(ModelError::from)?.to_vec();
				request.files.push((fname, bytes));
			}
			"file_name" => file_name = Some(field.text().await.map_err(ModelError::from)?),
			"chunk_index" => chunk_index = parse_u32("chunk_index", &field.text().await.map_err(ModelError::from)?)?,
			"chunk_total" => chunk_total = parse_u32("chunk_total", &field.text().await.map_err(ModelError::from)?)?,
			"job_id" => {
				let value = field.text().await.map_err(ModelError::from)?;
				let value = value.trim().to_string();
				if !value.is_empty() {
					request.job_id = Some(value);
				}
			}
			"final" => request.final_field = Some(truthy(&field.text().await.map_err(ModelError::from)?)),
			_ => {}
		}
	}

	if let Some(bytes) = chunk_bytes {
		let name = file_name
			.or(part_file_name)
			.unwrap_or_else(|| "blob.bin".to_string());
		request.chunk = Some(ChunkUpload {
			file_name: name,
			chunk_index,
			chunk_total,
			bytes,
		});
	}

	let body = mc.upload(request).await?;
	Ok(Json(body))
}

#[derive(Deserialize)]
struct JobQuery {
	job_id: String,
}

async fn handler_progress(State(mc): State<ModelController>, Query(query): Query<JobQuery>) -> Result<Json<Value>> {
	let body = mc.progress(&query.job_id).await?;
	Ok(Json(body))
}

async fn handler_result(State(mc): State<ModelController>, Query(query): Query<JobQuery>) -> Result<Json<Value>> {
	let body = mc.result(&query.job_id).await?;
	Ok(Json(body))
}
