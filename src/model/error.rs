use derive_more::From;
use hyper::StatusCode;
use serde::Serialize;
use serde_with::{serde_as, DisplayFromStr};

use crate::error::ClientError;

pub type Result<T> = core::result::Result<T, Error>;

#[serde_as]
#[derive(Debug, Serialize, From, strum_macros::AsRefStr)]
pub enum Error {
	// -- Upload
	/// Continuation chunk arrived without the job id it belongs to.
	UploadMissingJobId,
	UploadBadChunkMeta(String),
	UploadChunkOutOfRange { index: u32, total: u32 },
	UploadNoSupportedFiles,

	// -- Job lifecycle
	/// Result polled before the pipeline finished; recoverable by retry.
	NotReady(String),

	// -- Lookups
	JobNotFound(String),
	ClusterNotFound(String),
	FaceNotFound(String),
	FileNotFound(String),

	// -- Curation
	NoiseClusterImmutable,
	Conflict(String),

	// -- Pipeline / storage
	Pipeline(String),
	Storage(String),

	// -- Externals
	#[from]
	Io(#[serde_as(as = "DisplayFromStr")] std::io::Error),

	#[from]
	Serde(#[serde_as(as = "DisplayFromStr")] serde_json::Error),

	#[from]
	Image(#[serde_as(as = "DisplayFromStr")] image::ImageError),

	#[from]
	Zip(#[serde_as(as = "DisplayFromStr")] zip::result::ZipError),

	#[from]
	Multipart(#[serde_as(as = "DisplayFromStr")] axum::extract::multipart::MultipartError),
}

// region:    --- Error Boilerplate

impl core::fmt::Display for Error {
	fn fmt(
		&self,
		fmt: &mut core::fmt::Formatter,
	) -> core::result::Result<(), core::fmt::Error> {
		write!(fmt, "{self:?}")
	}
}

impl std::error::Error for Error {}

// endregion: --- Error Boilerplate

impl Error {
	pub fn client_status_and_error(&self) -> (StatusCode, ClientError) {
		#[allow(unreachable_patterns)]
		match self {
			Error::NotReady(_) => (StatusCode::NOT_FOUND, ClientError::NOT_READY),

			Error::JobNotFound(_) => (StatusCode::NOT_FOUND, ClientError::NOT_FOUND),
			Error::ClusterNotFound(_) => (StatusCode::NOT_FOUND, ClientError::NOT_FOUND),
			Error::FaceNotFound(_) => (StatusCode::NOT_FOUND, ClientError::NOT_FOUND),
			Error::FileNotFound(_) => (StatusCode::NOT_FOUND, ClientError::NOT_FOUND),

			Error::UploadMissingJobId => (StatusCode::BAD_REQUEST, ClientError::INVALID_PARAMS),
			Error::UploadBadChunkMeta(_) => (StatusCode::BAD_REQUEST, ClientError::INVALID_PARAMS),
			Error::UploadChunkOutOfRange { .. } => (StatusCode::BAD_REQUEST, ClientError::INVALID_PARAMS),
			Error::UploadNoSupportedFiles => (StatusCode::BAD_REQUEST, ClientError::INVALID_PARAMS),
			Error::NoiseClusterImmutable => (StatusCode::BAD_REQUEST, ClientError::INVALID_PARAMS),

			Error::Conflict(_) => (StatusCode::CONFLICT, ClientError::CONFLICT),

			Error::Pipeline(_) => (StatusCode::INTERNAL_SERVER_ERROR, ClientError::SERVICE_ERROR),
			Error::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, ClientError::SERVICE_ERROR),

			_ => (StatusCode::INTERNAL_SERVER_ERROR, ClientError::SERVICE_ERROR),
		}
	}
}
