use crate::model::ModelController;
use crate::Result;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use serde::Deserialize;
use serde_json::Value;


pub fn routes(mc: ModelController) -> Router {
	Router::new()
		.route("/assign", post(handler_assign))
		.route("/reorder", post(handler_reorder))
		.route("/cluster/rename", post(handler_rename))
		.route("/cluster/delete", post(handler_cluster_delete))
		.route("/face/delete", post(handler_face_delete))
		.route("/export", post(handler_export))
		.route("/delete-originals", post(handler_delete_originals))
		.route("/purge-all", post(handler_purge_all))
		.with_state(mc)
}

#[derive(Deserialize)]
struct AssignBody {
	job_id: String,
	path: String,
	target_cid: i64,
}

async fn handler_assign(State(mc): State<ModelController>, Json(body): Json<AssignBody>) -> Result<Json<Value>> {
	let result = mc.assign_face(&body.job_id, &body.path, body.target_cid).await?;
	Ok(Json(result))
}

#[derive(Deserialize)]
struct ReorderBody {
	job_id: String,
	cid: i64,
	order: Vec<String>,
}

async fn handler_reorder(State(mc): State<ModelController>, Json(body): Json<ReorderBody>) -> Result<Json<Value>> {
	let result = mc.reorder_cluster(&body.job_id, body.cid, body.order).await?;
	Ok(Json(result))
}

#[derive(Deserialize)]
struct RenameBody {
	job_id: String,
	cid: i64,
	name: String,
}

async fn handler_rename(State(mc): State<ModelController>, Json(body): Json<RenameBody>) -> Result<Json<Value>> {
	let result = mc.rename_cluster(&body.job_id, body.cid, &body.name).await?;
	Ok(Json(result))
}

#[derive(Deserialize)]
struct ClusterBody {
	job_id: String,
	cid: i64,
}

async fn handler_cluster_delete(State(mc): State<ModelController>, Json(body): Json<ClusterBody>) -> Result<Json<Value>> {
	let result = mc.delete_cluster(&body.job_id, body.cid).await?;
	Ok(Json(result))
}

#[derive(Deserialize)]
struct FaceBody {
	job_id: String,
	path: String,
}

async fn handler_face_delete(State(mc): State<ModelController>, Json(body): Json<FaceBody>) -> Result<Json<Value>> {
	let result = mc.delete_face(&body.job_id, &body.path).await?;
	Ok(Json(result))
}

#[derive(Deserialize)]
struct ExportBody {
	job_id: String,
	paths: Vec<String>,
}

async fn handler_export(State(mc): State<ModelController>, Json(body): Json<ExportBody>) -> Result<Response> {
	let archive = mc.export(&body.job_id, body.paths).await?;
	let filename = format!("attachment; filename=\"{}_export.zip\"", body.job_id);
	let response = (
		[
			(header::CONTENT_TYPE, "application/zip".to_string()),
			(header::CONTENT_DISPOSITION, filename),
		],
		archive,
	)
		.into_response();
	Ok(response)
}

#[derive(Deserialize)]
struct JobBody {
	job_id: String,
}

async fn handler_delete_originals(State(mc): State<ModelController>, Json(body): Json<JobBody>) -> Result<Json<Value>> {
	let result = mc.delete_originals(&body.job_id).await?;
	Ok(Json(result))
}

async fn handler_purge_all(State(mc): State<ModelController>) -> Result<Json<Value>> {
	let result = mc.purge_all().await?;
	Ok(Json(result))
}
