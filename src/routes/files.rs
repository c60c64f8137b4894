use std::path::Component;

use crate::model::error::Error as ModelError;
use crate::model::ModelController;
use crate::tools::file_tools::get_mime_from_filename;
use crate::{Error, Result};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use axum::{routing::get, Router};
use tokio_util::io::ReaderStream;


pub fn routes(mc: ModelController) -> Router {
	Router::new()
		.route("/:job_id/*path", get(handler_out_file))
		.with_state(mc)
}

/// Serves grouped originals and face thumbnails out of a job's output tree.
async fn handler_out_file(Path((job_id, path)): Path<(String, String)>, State(mc): State<ModelController>) -> Result<Response> {
	let rel = std::path::Path::new(&path);
	let escapes = rel.is_absolute()
		|| rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
	if escapes {
		return Err(Error::NotFound);
	}

	let abs = mc.config().job_output_dir(&job_id).join(rel);
	if !abs.is_file() {
		return Err(Error::NotFound);
	}

	let file = tokio::fs::File::open(&abs).await.map_err(ModelError::from)?;
	let stream = ReaderStream::new(file);
	let mime = get_mime_from_filename(&path).unwrap_or_else(|| "application/octet-stream".to_string());

	let response = Response::builder()
		.header(header::CONTENT_TYPE, mime)
		.body(Body::from_stream(stream))
		.map_err(|err| Error::Error { message: err.to_string() })?;
	Ok(response)
}
