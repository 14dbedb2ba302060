//! Minimal server-rendered pages. They share the session pipeline with the
//! API: `/` greets whoever is logged in, `/me` requires a session.

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};

use crate::{
    auth::extractors::{AuthUser, MaybeUser},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(overview))
        .route("/me", get(account))
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\">\
         <title>Tourbook | {}</title></head>\n<body>\n{}\n</body>\n</html>\n",
        escape(title),
        body
    )
}

pub fn error_page(status: StatusCode, message: &str) -> Response {
    let body = format!(
        "<main class=\"error\"><h2>Uh oh! Something went wrong!</h2>\
         <p class=\"error__msg\">{}</p></main>",
        escape(message)
    );
    (status, Html(page("Something went wrong!", &body))).into_response()
}

async fn overview(MaybeUser(user): MaybeUser) -> Html<String> {
    let nav = match user {
        Some(u) => format!(
            "<nav><a href=\"/me\">{}</a></nav>",
            escape(&u.name)
        ),
        None => "<nav><a href=\"/login\">Log in</a></nav>".to_string(),
    };
    Html(page("All Tours", &format!("{nav}<h1>All Tours</h1>")))
}

async fn account(AuthUser(user): AuthUser) -> Html<String> {
    let body = format!(
        "<h1>Your account</h1><dl><dt>Name</dt><dd>{}</dd>\
         <dt>Email</dt><dd>{}</dd><dt>Role</dt><dd>{}</dd></dl>",
        escape(&user.name),
        escape(&user.email),
        user.role
    );
    Html(page("Your account", &body))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        app::build_app,
        auth::{jwt::JwtKeys, repo::UserStore, repo_types::NewUser},
    };
    use axum::extract::FromRef;

    async fn text(res: Response) -> String {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("<b>\"x\" & 'y'</b>"), "&lt;b&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/b&gt;");
    }

    #[tokio::test]
    async fn overview_works_anonymously_and_with_bad_cookie() {
        let fake = AppState::fake();
        let res = build_app(fake.state.clone())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(text(res).await.contains("Log in"));

        let req = Request::builder()
            .uri("/")
            .header(header::COOKIE, "jwt=loggedout")
            .body(Body::empty())
            .unwrap();
        let res = build_app(fake.state.clone()).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn overview_greets_logged_in_user() {
        let fake = AppState::fake();
        let user = fake
            .store
            .create(NewUser {
                name: "<Jonas>".into(),
                email: "jonas@example.com".into(),
                password_hash: "unused".into(),
                role: Default::default(),
            })
            .await
            .unwrap();
        let token = JwtKeys::from_ref(&fake.state).sign(user.id).unwrap();
        let req = Request::builder()
            .uri("/")
            .header(header::COOKIE, format!("jwt={token}"))
            .body(Body::empty())
            .unwrap();
        let html = text(build_app(fake.state.clone()).oneshot(req).await.unwrap()).await;
        assert!(html.contains("&lt;Jonas&gt;"));
        assert!(!html.contains("<Jonas>"));
    }

    #[tokio::test]
    async fn account_page_without_session_renders_error_page() {
        let fake = AppState::fake();
        let res = build_app(fake.state.clone())
            .oneshot(Request::builder().uri("/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            res.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        assert!(text(res).await.contains("You are not logged in"));
    }
}
