//! Credential lifecycle: signup, login, password reset and password update.
//!
//! All operations are free functions over [`AppState`]; the user record stays
//! plain data.

use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{
            ForgotPasswordRequest, LoginRequest, Pagination, ResetPasswordRequest, SignupRequest,
            UpdateMeRequest, UpdatePasswordRequest,
        },
        jwt::JwtKeys,
        password::{hash_password_async, verify_password_async},
        repo_types::{NewUser, User},
        reset_token::{create_password_reset_token, hash_reset_token},
    },
    error::AppError,
    mailer::Email,
    state::AppState,
};

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PAGE: i64 = 100;

/// Well-formed Argon2id digest with default parameters that no password
/// matches. Verified on the unknown-email path so that a miss costs the same
/// as a wrong password.
const DUMMY_PASSWORD_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$\
     c29tZXNhbHRzb21lc2FsdA$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// A freshly opened session: the signed token and its owner.
#[derive(Debug)]
pub struct Session {
    pub token: String,
    pub user: User,
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(raw: &str) -> Result<String, AppError> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(AppError::Validation("Please provide a valid email".into()));
    }
    Ok(email)
}

fn validate_new_password(password: &str, confirm: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must have at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if password != confirm {
        return Err(AppError::Validation("Passwords are not the same".into()));
    }
    Ok(())
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

/// Timestamp recorded on a password change. Backdated by a second so that
/// the token issued in the same response (second-granular `iat`) stays fresh.
fn password_changed_at(now: OffsetDateTime) -> OffsetDateTime {
    now - Duration::seconds(1)
}

pub async fn correct_password(candidate: String, user: &User) -> Result<bool, AppError> {
    Ok(verify_password_async(candidate, user.password_hash.clone()).await?)
}

fn open_session(state: &AppState, user: User) -> Result<Session, AppError> {
    let token = JwtKeys::from_ref(state).sign(user.id)?;
    Ok(Session { token, user })
}

pub async fn signup(state: &AppState, req: SignupRequest) -> Result<Session, AppError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::Validation("Please tell us your name".into()));
    }
    let email = normalize_email(&req.email)?;
    validate_new_password(&req.password, &req.password_confirm)?;

    let password_hash = hash_password_async(req.password).await?;
    let user = state
        .users
        .create(NewUser {
            name,
            email,
            password_hash,
            role: req.role.unwrap_or_default(),
        })
        .await?;

    info!(user_id = %user.id, email = %user.email, role = %user.role, "user signed up");
    open_session(state, user)
}

pub async fn login(state: &AppState, req: LoginRequest) -> Result<Session, AppError> {
    let (Some(email), Some(password)) = (non_empty(req.email), non_empty(req.password)) else {
        return Err(AppError::MissingCredentials);
    };
    let email = email.trim().to_lowercase();

    let Some(user) = state.users.find_by_email(&email).await? else {
        verify_password_async(password, DUMMY_PASSWORD_HASH.to_string()).await?;
        warn!(email = %email, "login unknown email");
        return Err(AppError::InvalidCredentials);
    };
    if !correct_password(password, &user).await? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::InvalidCredentials);
    }

    info!(user_id = %user.id, "user logged in");
    open_session(state, user)
}

/// Stores a reset token and mails its link. If delivery fails the token is
/// withdrawn so that no valid, undelivered token is left behind.
pub async fn forgot_password(state: &AppState, req: ForgotPasswordRequest) -> Result<(), AppError> {
    let Some(email) = non_empty(req.email) else {
        return Err(AppError::Validation("Please provide your email".into()));
    };
    let email = email.trim().to_lowercase();
    let user = state
        .users
        .find_by_email(&email)
        .await?
        .ok_or(AppError::NoSuchUser)?;

    let ttl = Duration::minutes(state.config.reset_ttl_minutes);
    let token = create_password_reset_token(OffsetDateTime::now_utc(), ttl);
    state
        .users
        .set_reset_token(user.id, &token.hash, token.expires_at)
        .await?;

    let reset_url = format!(
        "{}/api/v1/users/reset-password/{}",
        state.config.public_url, token.raw
    );
    let message = Email {
        to: user.email.clone(),
        subject: format!(
            "Your password reset token (valid for {} minutes)",
            state.config.reset_ttl_minutes
        ),
        body: format!(
            "Forgot your password? Submit a PATCH request with your new password and \
             password_confirm to: {reset_url}\nIf you didn't forget your password, \
             please ignore this email."
        ),
    };

    if let Err(e) = state.mailer.send(message).await {
        if let Err(clear_err) = state.users.clear_reset_token(user.id, &token.hash).await {
            error!(user_id = %user.id, error = %clear_err, "failed to withdraw reset token");
        }
        return Err(AppError::EmailDelivery(e));
    }

    info!(user_id = %user.id, "password reset token sent");
    Ok(())
}

pub async fn reset_password(
    state: &AppState,
    raw_token: &str,
    req: ResetPasswordRequest,
) -> Result<Session, AppError> {
    validate_new_password(&req.password, &req.password_confirm)?;

    let token_hash = hash_reset_token(raw_token);
    let password_hash = hash_password_async(req.password).await?;
    let now = OffsetDateTime::now_utc();

    let user = state
        .users
        .consume_reset_token(&token_hash, now, &password_hash, password_changed_at(now))
        .await?
        .ok_or(AppError::InvalidOrExpiredResetToken)?;

    info!(user_id = %user.id, "password reset");
    open_session(state, user)
}

pub async fn update_password(
    state: &AppState,
    user: &User,
    req: UpdatePasswordRequest,
) -> Result<Session, AppError> {
    if !correct_password(req.password_current, user).await? {
        warn!(user_id = %user.id, "update password with wrong current password");
        return Err(AppError::IncorrectCurrentPassword);
    }
    validate_new_password(&req.password, &req.password_confirm)?;

    let password_hash = hash_password_async(req.password).await?;
    let now = OffsetDateTime::now_utc();
    let updated = state
        .users
        .update_password(user.id, &password_hash, password_changed_at(now))
        .await?
        .ok_or(AppError::UserGone)?;

    info!(user_id = %updated.id, "password updated");
    open_session(state, updated)
}

pub async fn update_me(state: &AppState, user: &User, req: UpdateMeRequest) -> Result<User, AppError> {
    if req.password.is_some() || req.password_confirm.is_some() {
        return Err(AppError::Validation(
            "This route is not for password updates. Please use /update-password".into(),
        ));
    }
    let name = match non_empty(req.name) {
        Some(n) => n.trim().to_string(),
        None => user.name.clone(),
    };
    let email = match non_empty(req.email) {
        Some(e) => normalize_email(&e)?,
        None => user.email.clone(),
    };

    let updated = state
        .users
        .update_profile(user.id, &name, &email)
        .await?
        .ok_or(AppError::UserGone)?;
    info!(user_id = %updated.id, "profile updated");
    Ok(updated)
}

pub async fn deactivate_me(state: &AppState, user: &User) -> Result<(), AppError> {
    state.users.deactivate(user.id).await?;
    info!(user_id = %user.id, "user deactivated");
    Ok(())
}

pub async fn list_users(state: &AppState, page: Pagination) -> Result<Vec<User>, AppError> {
    let limit = page.limit.clamp(1, MAX_PAGE);
    let offset = page.offset.max(0);
    Ok(state.users.list(limit, offset).await?)
}

pub async fn get_user(state: &AppState, id: Uuid) -> Result<User, AppError> {
    state
        .users
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound("No user found with that ID".into()))
}
