//! Request extractors.

use axum::extract::{FromRequest, Request};
use axum::Json;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// JSON body extractor whose rejections speak the error envelope.
///
/// Axum's stock `Json` rejection replies with plain text; every error
/// this server produces must carry `{success, error, code}`, so body
/// parsing failures are folded into `VALIDATION_ERROR` here.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<serde_json::Value>::from_request(req, state)
            .await
            .map_err(|e| ApiError::Validation(format!("invalid JSON body: {e}")))?;
        serde_json::from_value(value)
            .map(ValidatedJson)
            .map_err(|e| ApiError::Validation(e.to_string()))
    }
}
