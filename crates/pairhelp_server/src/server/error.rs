#![forbid(unsafe_code)]

use pairhelp_protocol::{Msg, codes};
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced to clients as `error{code, message}`.
#[derive(Debug, Error)]
pub enum ServiceError {
	#[error("not found: {0}")]
	NotFound(String),

	#[error("unauthorized: {0}")]
	Unauthorized(String),

	#[error("store unavailable: {0}")]
	StoreUnavailable(#[source] StoreError),

	#[error("invalid state: {0}")]
	InvalidState(String),

	#[error("invalid request: {0}")]
	InvalidRequest(String),
}

impl ServiceError {
	pub fn code(&self) -> &'static str {
		match self {
			ServiceError::NotFound(_) => codes::NOT_FOUND,
			ServiceError::Unauthorized(_) => codes::UNAUTHORIZED,
			ServiceError::StoreUnavailable(_) => codes::STORE_UNAVAILABLE,
			ServiceError::InvalidState(_) => codes::INVALID_STATE,
			ServiceError::InvalidRequest(_) => codes::INVALID_REQUEST,
		}
	}

	pub fn to_msg(&self) -> Msg {
		Msg::error(self.code(), self.to_string())
	}
}

impl From<StoreError> for ServiceError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotFound => ServiceError::NotFound("record not found".to_string()),
			StoreError::Conflict { .. } => ServiceError::InvalidState(format!("record changed concurrently ({e})")),
			other => ServiceError::StoreUnavailable(other),
		}
	}
}
