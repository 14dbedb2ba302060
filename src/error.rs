//! Request-lifecycle error taxonomy and its rendering.
//!
//! Every failure in the service ends up as an [`AppError`]. Converting one into
//! a response logs it once and attaches it to the response; the
//! [`normalize_errors`] middleware then renders the final body according to the
//! deployment mode and whether the request targeted the API or a page.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Request, State,
    },
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::{config::Environment, state::AppState, views};

const GENERIC_API_MESSAGE: &str = "Something went wrong!";
const GENERIC_PAGE_MESSAGE: &str = "Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Expected condition whose message is safe to show to the caller.
    Operational,
    /// Bug or infrastructure failure; detail stays in the server log.
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Please provide email and password")]
    MissingCredentials,

    #[error("Incorrect email or password")]
    InvalidCredentials,

    #[error("You are not logged in. Please log in to get access")]
    NoCredentials,

    #[error("Invalid token. Please log in again")]
    InvalidToken,

    #[error("Your session has expired. Please log in again")]
    ExpiredToken,

    #[error("The user belonging to this token no longer exists")]
    UserGone,

    #[error("Password was changed recently. Please log in again")]
    StaleSession,

    #[error("You do not have permission to perform this action")]
    Forbidden,

    #[error("There is no user with that email address")]
    NoSuchUser,

    #[error("Token is invalid or has expired")]
    InvalidOrExpiredResetToken,

    #[error("Your current password is wrong")]
    IncorrectCurrentPassword,

    #[error("Invalid input data. {0}")]
    Validation(String),

    #[error("Duplicate field value: {0}. Please use another value")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    #[error("There was an error sending the email. Try again later")]
    EmailDelivery(anyhow::Error),

    #[error("internal error: {0:#}")]
    Unknown(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingCredentials
            | AppError::InvalidOrExpiredResetToken
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials
            | AppError::NoCredentials
            | AppError::InvalidToken
            | AppError::ExpiredToken
            | AppError::UserGone
            | AppError::StaleSession
            | AppError::IncorrectCurrentPassword => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NoSuchUser | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::EmailDelivery(_) | AppError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code, used in logs and development payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::MissingCredentials => "MISSING_CREDENTIALS",
            AppError::InvalidCredentials => "INVALID_CREDENTIALS",
            AppError::NoCredentials => "NO_CREDENTIALS",
            AppError::InvalidToken => "INVALID_TOKEN",
            AppError::ExpiredToken => "EXPIRED_TOKEN",
            AppError::UserGone => "USER_GONE",
            AppError::StaleSession => "STALE_SESSION",
            AppError::Forbidden => "FORBIDDEN",
            AppError::NoSuchUser => "NO_SUCH_USER",
            AppError::InvalidOrExpiredResetToken => "INVALID_OR_EXPIRED_RESET_TOKEN",
            AppError::IncorrectCurrentPassword => "INCORRECT_CURRENT_PASSWORD",
            AppError::Validation(_) => "VALIDATION_FAILURE",
            AppError::Conflict(_) => "CONFLICT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            AppError::EmailDelivery(_) => "EMAIL_DELIVERY",
            AppError::Unknown(_) => "UNKNOWN",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Unknown(_) => ErrorClass::Unknown,
            _ => ErrorClass::Operational,
        }
    }

    /// Full diagnostic text, including the cause chain of wrapped errors.
    fn detail(&self) -> String {
        match self {
            AppError::Unknown(e) | AppError::EmailDelivery(e) => format!("{e:?}"),
            other => format!("{other:?}"),
        }
    }

    fn log(&self) {
        let kind = self.kind();
        let status = self.status().as_u16();
        match self {
            AppError::Unknown(e) => error!(kind, status, error = ?e, "unhandled error"),
            AppError::EmailDelivery(e) => error!(kind, status, error = ?e, "email delivery failed"),
            AppError::ExpiredToken => debug!(kind, status, "session token expired"),
            AppError::InvalidToken | AppError::StaleSession | AppError::UserGone => {
                warn!(kind, status, "session rejected")
            }
            other => debug!(kind, status, message = %other, "request failed"),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

/// Where the failed request came from; decides JSON payload vs HTML page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Api,
    Browser,
}

impl Surface {
    pub fn of(path: &str) -> Self {
        if path.starts_with("/api") {
            Surface::Api
        } else {
            Surface::Browser
        }
    }
}

fn status_label(status: StatusCode) -> &'static str {
    if status.is_client_error() {
        "fail"
    } else {
        "error"
    }
}

pub fn render(err: &AppError, env: Environment, surface: Surface) -> Response {
    let status = err.status();
    let operational = err.class() == ErrorClass::Operational;

    match (surface, env) {
        (Surface::Api, Environment::Development) => (
            status,
            Json(json!({
                "status": status_label(status),
                "error": { "kind": err.kind(), "class": err.class() },
                "message": err.to_string(),
                "stack": err.detail(),
            })),
        )
            .into_response(),
        (Surface::Api, Environment::Production) if operational => (
            status,
            Json(json!({
                "status": status_label(status),
                "message": err.to_string(),
            })),
        )
            .into_response(),
        (Surface::Api, Environment::Production) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "message": GENERIC_API_MESSAGE })),
        )
            .into_response(),
        (Surface::Browser, Environment::Development) => {
            views::error_page(status, &err.to_string())
        }
        (Surface::Browser, Environment::Production) if operational => {
            views::error_page(status, &err.to_string())
        }
        (Surface::Browser, Environment::Production) => {
            views::error_page(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_PAGE_MESSAGE)
        }
    }
}

/// Carries the original error on a response until [`normalize_errors`] sees it.
#[derive(Clone)]
struct ErrorReport(Arc<AppError>);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();
        // Sanitized fallback for responses that never pass through the middleware.
        let mut res = render(&self, Environment::Production, Surface::Api);
        res.extensions_mut().insert(ErrorReport(Arc::new(self)));
        res
    }
}

pub async fn normalize_errors(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let surface = Surface::of(req.uri().path());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let res = next.run(req).await;
    match res.extensions().get::<ErrorReport>() {
        Some(ErrorReport(err)) => render(err, state.config.environment, surface),
        // The router answers method mismatches itself, without an `AppError`.
        None if res.status() == StatusCode::METHOD_NOT_ALLOWED => {
            let err = AppError::MethodNotAllowed(format!("Can't {method} {path} on this server"));
            err.log();
            let allow = res.headers().get(header::ALLOW).cloned();
            let mut rendered = render(&err, state.config.environment, surface);
            if let Some(allow) = allow {
                rendered.headers_mut().insert(header::ALLOW, allow);
            }
            rendered
        }
        None => res,
    }
}
