// src/api/envelope.rs
//! Every reply is `{"d": "<json text>"}`: the payload serialised to a JSON
//! string and wrapped once more, the way the web client unpacks it.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, HttpResponseBuilder, ResponseError};
use serde::Serialize;
use serde_json::json;

use crate::errors::ReportError;

pub fn wrap<T: Serialize>(payload: &T) -> Result<serde_json::Value, ReportError> {
    Ok(json!({ "d": serde_json::to_string(payload)? }))
}

pub fn ok<T: Serialize>(payload: &T) -> actix_web::Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(wrap(payload)?))
}

impl ResponseError for ReportError {
    fn status_code(&self) -> StatusCode {
        match self {
            ReportError::Validation(_)
            | ReportError::UnknownReport(_)
            | ReportError::JsonParse(_)
            | ReportError::Base64(_) => StatusCode::BAD_REQUEST,
            ReportError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ReportError::SerializationConflict(_) | ReportError::NoResult(_) => StatusCode::CONFLICT,
            ReportError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            log::error!("Request failed: {}", self);
        }
        let payload = json!({ "result": false, "message": self.to_string() });
        HttpResponseBuilder::new(self.status_code()).json(json!({ "d": payload.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_wrapped_as_text() {
        let wrapped = wrap(&json!({ "result": true })).unwrap();
        assert_eq!(wrapped, json!({ "d": "{\"result\":true}" }));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ReportError::Validation("x".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ReportError::JobNotFound("x".to_string()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ReportError::SerializationConflict("x".to_string()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(ReportError::Busy.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ReportError::Mail("x".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
