//! REST error type and its HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cwmp_bridge::DispatchError;

/// Errors returned by REST handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("unknown cwmp method '{0}'")]
    UnknownMethod(String),

    #[error("unknown usp message '{0}'")]
    UnknownMessage(String),

    #[error("unknown message transfer protocol '{0}'")]
    UnknownMtp(String),

    #[error("invalid JSON body: {0}")]
    InvalidBody(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Dispatch(e) => match e {
                DispatchError::DeviceBusy { .. } => StatusCode::CONFLICT,
                DispatchError::DeviceAnswerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                DispatchError::PublishFailure(_)
                | DispatchError::Cancelled { .. }
                | DispatchError::DeviceOffline { .. } => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::DeviceFault { .. } => StatusCode::BAD_REQUEST,
            },
            Self::UnknownMethod(_) | Self::UnknownMessage(_) | Self::UnknownMtp(_) => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch(e) => e.kind(),
            Self::UnknownMethod(_) | Self::UnknownMessage(_) => "unknown_method",
            Self::UnknownMtp(_) => "unknown_mtp",
            Self::InvalidBody(_) => "invalid_body",
        }
    }

    fn body(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Self::Dispatch(e) = self {
            error["retryable"] = e.is_retryable().into();
            if let DispatchError::DeviceFault { code, .. } = e {
                error["code"] = (*code).into();
            }
        }
        serde_json::json!({ "error": error })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cwmp_bridge::CancelReason;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                DispatchError::DeviceBusy {
                    device_id: "CPE-1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                DispatchError::DeviceAnswerTimeout {
                    device_id: "CPE-1".into(),
                    timeout: Duration::from_secs(10),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                DispatchError::PublishFailure("bus closed".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                DispatchError::Cancelled {
                    reason: CancelReason::Shutdown,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                DispatchError::DeviceOffline {
                    device_id: "CPE-1".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                DispatchError::DeviceFault {
                    code: 9005,
                    message: "Invalid parameter name".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
        assert_eq!(
            ApiError::UnknownMethod("reboot".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::UnknownMtp("coap".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_fault_body_carries_code() {
        let error = ApiError::from(DispatchError::DeviceFault {
            code: 9005,
            message: "Invalid parameter name".into(),
        });
        let body = error.body();
        assert_eq!(body["error"]["kind"], "device_fault");
        assert_eq!(body["error"]["code"], 9005);
        assert_eq!(body["error"]["retryable"], false);
        assert_eq!(
            body["error"]["message"],
            "device fault 9005: Invalid parameter name"
        );
    }
}
