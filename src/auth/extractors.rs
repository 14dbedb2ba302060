use std::convert::Infallible;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use tracing::debug;

use super::{
    jwt::JwtKeys,
    repo_types::{Role, User},
    session::{authenticate, require_role, try_authenticate},
};
use crate::{error::AppError, state::AppState};

/// The authenticated user of this request.
///
/// Reuses the user attached by [`protect`] when present, otherwise runs the
/// session pipeline itself.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthUser>() {
            return Ok(user.clone());
        }
        let keys = JwtKeys::from_ref(state);
        let user = authenticate(state.users.as_ref(), &keys, &parts.headers).await?;
        parts.extensions.insert(AuthUser(user.clone()));
        Ok(AuthUser(user))
    }
}

/// The logged-in user if the request carries a usable session, else `None`.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<User>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(AuthUser(user)) = parts.extensions.get::<AuthUser>() {
            return Ok(MaybeUser(Some(user.clone())));
        }
        let keys = JwtKeys::from_ref(state);
        Ok(MaybeUser(
            try_authenticate(state.users.as_ref(), &keys, &parts.headers).await,
        ))
    }
}

/// Route layer: rejects unauthenticated requests and attaches [`AuthUser`].
pub async fn protect(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let keys = JwtKeys::from_ref(&state);
    let user = authenticate(state.users.as_ref(), &keys, req.headers()).await?;
    debug!(user_id = %user.id, role = %user.role, "request authenticated");
    req.extensions_mut().insert(AuthUser(user));
    Ok(next.run(req).await)
}

/// Route layer placed inside [`protect`]: only `allowed` roles pass.
pub async fn restrict_to(
    allowed: &'static [Role],
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let AuthUser(user) = req.extensions().get::<AuthUser>().ok_or_else(|| {
        AppError::Unknown(anyhow::anyhow!(
            "role gate reached without an authenticated user"
        ))
    })?;
    require_role(user, allowed)?;
    Ok(next.run(req).await)
}
