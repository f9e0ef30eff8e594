//! The user-facing JSON web server that listens for classification requests

use crate::config::Settings;
use crate::preprocess::ImageError;
use crate::torch::Classifier;
use actix_web::error::JsonPayloadError;
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use std::collections::HashMap;
use thiserror::Error;

pub mod protocol;
pub mod routes;

/// Shared state of every worker
pub struct AppState {
    pub classifier: Classifier,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(classifier: Classifier, settings: &Settings) -> Self {
        AppState {
            classifier,
            max_upload_bytes: settings.server.max_upload_bytes,
        }
    }
}

/// Register the routes and extractor limits on an `App`
pub fn configure(max_upload_bytes: usize) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        // base64 inflates the payload by a third, plus room for the JSON
        let json_limit = max_upload_bytes / 3 * 4 + 4096;
        let json = web::JsonConfig::default()
            .limit(json_limit)
            .error_handler(json_error);
        cfg.app_data(json)
            .service(routes::root)
            .service(routes::predict)
            .service(routes::predict_base64)
            .service(routes::model_info);
    }
}

/// Answer JSON extractor failures with the same body as every other error
fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let err = match err {
        JsonPayloadError::OverflowKnownLength { .. } | JsonPayloadError::Overflow { .. } => {
            RequestError::TooLarge(err.to_string())
        }
        err => RequestError::Json(err.to_string()),
    };
    WebError::from(err).into()
}

/// Malformed requests, answered with 400 (413 for `TooLarge`)
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no file was uploaded: send a multipart field named \"file\"")]
    MissingFile,

    #[error("invalid multipart body: {0}")]
    Multipart(String),

    #[error("invalid JSON body: {0}")]
    Json(String),

    #[error("request body too large: {0}")]
    TooLarge(String),

    #[error("invalid base64 image: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("image {field} is {actual}, but the request declared {declared}")]
    DimensionMismatch {
        field: &'static str,
        declared: u32,
        actual: u32,
    },
}

#[derive(Debug)]
pub struct WebError {
    err: anyhow::Error,
}

impl std::fmt::Display for WebError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.err)
    }
}

impl actix_web::error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        let err = HashMap::from([("errors", vec![self.to_string()])]);

        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(err)
    }

    fn status_code(&self) -> StatusCode {
        if let Some(err) = self.err.downcast_ref::<ImageError>() {
            return match err {
                ImageError::TooLarge(..) => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
        }
        if let Some(err) = self.err.downcast_ref::<RequestError>() {
            return match err {
                RequestError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl From<anyhow::Error> for WebError {
    fn from(err: anyhow::Error) -> WebError {
        WebError { err }
    }
}

impl From<ImageError> for WebError {
    fn from(err: ImageError) -> Self {
        WebError { err: err.into() }
    }
}

impl From<RequestError> for WebError {
    fn from(err: RequestError) -> Self {
        WebError { err: err.into() }
    }
}
