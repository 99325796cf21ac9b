//! Extractors whose rejections use the engine's error body.
//!
//! Plain `Json`/`Query` reject with text bodies and, for well-formed JSON of
//! the wrong shape, 422. The admin API reports every malformed request as a
//! 400 validation error instead.

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Query, Request},
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::JobsError;

/// JSON body extractor rejecting with [`JobsError::validation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = JobsError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| JobsError::validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// Query string extractor rejecting with [`JobsError::validation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = JobsError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| JobsError::validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}
