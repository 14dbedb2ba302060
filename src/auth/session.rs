//! Session decision core.
//!
//! A request moves through `extract_token → JwtKeys::verify → resolve user →
//! freshness check`; each stage returns early with the rejection reason. The
//! role gate is a separate step that only runs on an authenticated user.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use axum_extra::extract::cookie::CookieJar;
use tracing::{debug, warn};

use crate::{
    auth::{
        jwt::{Claims, JwtKeys},
        repo::UserStore,
        repo_types::{Role, User},
    },
    error::AppError,
};

pub const SESSION_COOKIE: &str = "jwt";

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

/// Authorization header first, then the session cookie.
pub fn extract_token(headers: &HeaderMap) -> Result<String, AppError> {
    bearer_token(headers)
        .or_else(|| cookie_token(headers))
        .ok_or(AppError::NoCredentials)
}

/// True when the password changed after a token issued at `issued_at`.
pub fn changed_password_after(user: &User, issued_at: i64) -> bool {
    user.password_changed_at
        .is_some_and(|changed| changed.unix_timestamp() > issued_at)
}

async fn resolve_user(store: &dyn UserStore, claims: &Claims) -> Result<User, AppError> {
    store
        .find_by_id(claims.sub)
        .await?
        .ok_or(AppError::UserGone)
}

fn ensure_fresh(user: &User, claims: &Claims) -> Result<(), AppError> {
    if changed_password_after(user, claims.iat) {
        return Err(AppError::StaleSession);
    }
    Ok(())
}

pub async fn authenticate(
    store: &dyn UserStore,
    keys: &JwtKeys,
    headers: &HeaderMap,
) -> Result<User, AppError> {
    let token = extract_token(headers)?;
    let claims = keys.verify(&token)?;
    let user = resolve_user(store, &claims).await?;
    ensure_fresh(&user, &claims)?;
    Ok(user)
}

/// Same pipeline as [`authenticate`], but any rejection means "anonymous".
pub async fn try_authenticate(
    store: &dyn UserStore,
    keys: &JwtKeys,
    headers: &HeaderMap,
) -> Option<User> {
    match authenticate(store, keys, headers).await {
        Ok(user) => Some(user),
        Err(AppError::Unknown(e)) => {
            warn!(error = ?e, "session lookup failed; treating request as anonymous");
            None
        }
        Err(e) => {
            debug!(kind = e.kind(), "treating request as anonymous");
            None
        }
    }
}

pub fn require_role(user: &User, allowed: &[Role]) -> Result<(), AppError> {
    if allowed.contains(&user.role) {
        Ok(())
    } else {
        warn!(user_id = %user.id, role = %user.role, "role not permitted");
        Err(AppError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::HeaderValue;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use super::*;
    use crate::auth::{
        repo::memory::MemoryUserStore,
        repo_types::NewUser,
    };
    use crate::config::JwtConfig;

    fn keys() -> JwtKeys {
        JwtKeys::from(&JwtConfig {
            secret: "test-secret".into(),
            issuer: "iss".into(),
            audience: "aud".into(),
            ttl_minutes: 60,
            cookie_ttl_days: 1,
        })
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    async fn store_with_user(role: Role) -> (Arc<MemoryUserStore>, User) {
        let store = Arc::new(MemoryUserStore::default());
        let user = store
            .create(NewUser {
                name: "Test".into(),
                email: format!("{}@example.com", Uuid::new_v4()),
                password_hash: "unused".into(),
                role,
            })
            .await
            .unwrap();
        (store, user)
    }

    #[test]
    fn header_takes_priority_over_cookie() {
        let mut headers = bearer("from-header");
        headers.insert("cookie", HeaderValue::from_static("jwt=from-cookie"));
        assert_eq!(extract_token(&headers).unwrap(), "from-header");
    }

    #[test]
    fn cookie_is_used_without_header() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("theme=dark; jwt=abc"));
        assert_eq!(extract_token(&headers).unwrap(), "abc");
    }

    #[test]
    fn non_bearer_scheme_falls_back_to_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert!(matches!(extract_token(&headers), Err(AppError::NoCredentials)));
        headers.insert("cookie", HeaderValue::from_static("jwt=abc"));
        assert_eq!(extract_token(&headers).unwrap(), "abc");
    }

    #[test]
    fn no_token_at_all_is_no_credentials() {
        assert!(matches!(
            extract_token(&HeaderMap::new()),
            Err(AppError::NoCredentials)
        ));
        assert!(matches!(extract_token(&bearer("")), Err(AppError::NoCredentials)));
    }

    #[tokio::test]
    async fn valid_token_authenticates() {
        let (store, user) = store_with_user(Role::User).await;
        let token = keys().sign(user.id).unwrap();
        let got = authenticate(store.as_ref(), &keys(), &bearer(&token))
            .await
            .unwrap();
        assert_eq!(got.id, user.id);
    }

    #[tokio::test]
    async fn garbage_token_is_invalid() {
        let (store, _) = store_with_user(Role::User).await;
        let err = authenticate(store.as_ref(), &keys(), &bearer("x.y.z"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));
    }

    #[tokio::test]
    async fn deactivated_user_is_gone() {
        let (store, user) = store_with_user(Role::User).await;
        let token = keys().sign(user.id).unwrap();
        store.deactivate(user.id).await.unwrap();
        let err = authenticate(store.as_ref(), &keys(), &bearer(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UserGone));
    }

    #[tokio::test]
    async fn token_issued_before_password_change_is_stale() {
        let (store, user) = store_with_user(Role::User).await;
        let now = OffsetDateTime::now_utc();
        let token = keys().sign_at(user.id, now - Duration::minutes(5)).unwrap();
        store
            .update_password(user.id, "new-hash", now - Duration::seconds(1))
            .await
            .unwrap();
        let err = authenticate(store.as_ref(), &keys(), &bearer(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StaleSession));

        let fresh = keys().sign(user.id).unwrap();
        assert!(authenticate(store.as_ref(), &keys(), &bearer(&fresh)).await.is_ok());
    }

    #[tokio::test]
    async fn anonymous_variant_swallows_rejections() {
        let (store, user) = store_with_user(Role::User).await;
        assert!(try_authenticate(store.as_ref(), &keys(), &HeaderMap::new())
            .await
            .is_none());
        assert!(try_authenticate(store.as_ref(), &keys(), &bearer("bad"))
            .await
            .is_none());
        let token = keys().sign(user.id).unwrap();
        let got = try_authenticate(store.as_ref(), &keys(), &bearer(&token)).await;
        assert_eq!(got.map(|u| u.id), Some(user.id));
    }

    #[tokio::test]
    async fn role_gate_checks_membership() {
        let (_, user) = store_with_user(Role::User).await;
        assert!(matches!(
            require_role(&user, &[Role::Admin]),
            Err(AppError::Forbidden)
        ));
        assert!(require_role(&user, &[Role::User, Role::Admin]).is_ok());

        let (_, admin) = store_with_user(Role::Admin).await;
        assert!(require_role(&admin, &[Role::Admin]).is_ok());
    }
}
