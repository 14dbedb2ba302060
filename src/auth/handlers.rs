use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    routing::{delete, get, patch, post},
    Json, Router,
};
use axum_extra::extract::{
    cookie::{Cookie, CookieJar, SameSite},
    WithRejection,
};
use time::{Duration, OffsetDateTime};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{
            AuthResponse, ForgotPasswordRequest, LoginRequest, Pagination, PublicUser,
            ResetPasswordRequest, SignupRequest, StatusResponse, UpdateMeRequest,
            UpdatePasswordRequest, UserData, UserResponse, UsersData, UsersResponse,
        },
        extractors::{protect, restrict_to, AuthUser},
        repo_types::{Role, User},
        services::{self, Session},
        session::SESSION_COOKIE,
    },
    config::AppConfig,
    error::AppError,
    state::AppState,
};

const ADMIN_ONLY: &[Role] = &[Role::Admin];
const LOGGED_OUT: &str = "loggedout";

type JsonBody<T> = WithRejection<Json<T>, AppError>;
type PathParam<T> = WithRejection<Path<T>, AppError>;
type QueryParams<T> = WithRejection<Query<T>, AppError>;

pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/users/signup", post(signup))
        .route("/users/login", post(login))
        .route("/users/logout", get(logout))
        .route("/users/forgot-password", post(forgot_password))
        .route("/users/reset-password/:token", patch(reset_password));

    let admin = Router::new()
        .route("/users", get(list_users))
        .route("/users/:id", get(get_user))
        .route_layer(middleware::from_fn(|req: Request, next: Next| {
            restrict_to(ADMIN_ONLY, req, next)
        }));

    let protected = Router::new()
        .route("/users/update-password", patch(update_password))
        .route("/users/me", get(me))
        .route("/users/update-me", patch(update_me))
        .route("/users/delete-me", delete(delete_me))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(state, protect));

    public.merge(protected)
}

/// Session cookie carrying `value` until `ttl` from now. Logout reuses it
/// with a placeholder value so both cookies share the same attributes.
fn session_cookie(config: &AppConfig, value: String, ttl: Duration) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, value))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .secure(config.environment.is_production())
        .expires(OffsetDateTime::now_utc() + ttl)
        .build()
}

/// Sets the session cookie and returns the token plus the public user.
fn send_session(
    state: &AppState,
    jar: CookieJar,
    status: StatusCode,
    session: Session,
) -> (StatusCode, CookieJar, Json<AuthResponse>) {
    let ttl = Duration::days(state.config.jwt.cookie_ttl_days);
    let jar = jar.add(session_cookie(&state.config, session.token.clone(), ttl));
    (
        status,
        jar,
        Json(AuthResponse {
            status: "success",
            token: session.token,
            data: UserData {
                user: PublicUser::from(session.user),
            },
        }),
    )
}

fn user_response(user: User) -> Json<UserResponse> {
    Json(UserResponse {
        status: "success",
        data: UserData {
            user: PublicUser::from(user),
        },
    })
}

#[instrument(skip(state, jar, payload))]
pub async fn signup(
    State(state): State<AppState>,
    jar: CookieJar,
    WithRejection(Json(payload), _): JsonBody<SignupRequest>,
) -> Result<(StatusCode, CookieJar, Json<AuthResponse>), AppError> {
    let session = services::signup(&state, payload).await?;
    Ok(send_session(&state, jar, StatusCode::CREATED, session))
}

#[instrument(skip(state, jar, payload))]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    WithRejection(Json(payload), _): JsonBody<LoginRequest>,
) -> Result<(StatusCode, CookieJar, Json<AuthResponse>), AppError> {
    let session = services::login(&state, payload).await?;
    Ok(send_session(&state, jar, StatusCode::OK, session))
}

/// Overwrites the session cookie with a placeholder that expires in seconds.
#[instrument(skip(state, jar))]
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> (CookieJar, Json<StatusResponse>) {
    let cookie = session_cookie(&state.config, LOGGED_OUT.into(), Duration::seconds(10));
    info!("session cookie cleared");
    (
        jar.add(cookie),
        Json(StatusResponse {
            status: "success",
            message: None,
        }),
    )
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    WithRejection(Json(payload), _): JsonBody<ForgotPasswordRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    services::forgot_password(&state, payload).await?;
    Ok(Json(StatusResponse {
        status: "success",
        message: Some("Token sent to email!".into()),
    }))
}

#[instrument(skip(state, jar, token, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    jar: CookieJar,
    WithRejection(Path(token), _): PathParam<String>,
    WithRejection(Json(payload), _): JsonBody<ResetPasswordRequest>,
) -> Result<(StatusCode, CookieJar, Json<AuthResponse>), AppError> {
    let session = services::reset_password(&state, &token, payload).await?;
    Ok(send_session(&state, jar, StatusCode::OK, session))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_password(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    jar: CookieJar,
    WithRejection(Json(payload), _): JsonBody<UpdatePasswordRequest>,
) -> Result<(StatusCode, CookieJar, Json<AuthResponse>), AppError> {
    let session = services::update_password(&state, &user, payload).await?;
    Ok(send_session(&state, jar, StatusCode::OK, session))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn me(AuthUser(user): AuthUser) -> Json<UserResponse> {
    user_response(user)
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    WithRejection(Json(payload), _): JsonBody<UpdateMeRequest>,
) -> Result<Json<UserResponse>, AppError> {
    let updated = services::update_me(&state, &user, payload).await?;
    Ok(user_response(updated))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn delete_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<StatusCode, AppError> {
    services::deactivate_me(&state, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
    WithRejection(Query(page), _): QueryParams<Pagination>,
) -> Result<Json<UsersResponse>, AppError> {
    let users: Vec<PublicUser> = services::list_users(&state, page)
        .await?
        .into_iter()
        .map(PublicUser::from)
        .collect();
    Ok(Json(UsersResponse {
        status: "success",
        results: users.len(),
        data: UsersData { users },
    }))
}

#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    WithRejection(Path(id), _): PathParam<Uuid>,
) -> Result<Json<UserResponse>, AppError> {
    let user = services::get_user(&state, id).await?;
    Ok(user_response(user))
}
