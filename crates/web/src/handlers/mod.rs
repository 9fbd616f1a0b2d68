use axum::{
    Json, Router,
    routing::{delete, get, post},
};
use serde_json::{Value, json};

use crate::AppState;

mod common;
mod events;
mod locks;
mod plans;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/", get(locks::get_index))
        .route("/lock", get(locks::get_lock))
        .route("/locks", delete(locks::delete_lock))
        .route("/events", post(events::post_events))
        .route("/plans", post(plans::post_plan))
        .route("/healthz", get(healthz))
}

async fn healthz() -> Json<Value> { Json(json!({ "status": "ok" })) }

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use terrapin_core::{
        config::{Config, DbConfig, GitHubConfig, ServerConfig},
        models::{Project, PullRequest, User},
    };
    use terrapin_db::Database;
    use terrapin_vcs::VcsClientProxy;
    use tower::ServiceExt;
    use url::Url;

    use crate::{AppState, app};

    async fn state(dir: &tempfile::TempDir, github: Option<GitHubConfig>) -> AppState {
        let config = Config {
            server: ServerConfig { port: 0, url: Url::parse("https://terrapin.example.com").unwrap() },
            db: DbConfig { url: format!("sqlite://{}", dir.path().join("terrapin.db").display()) },
            data_dir: dir.path().join("data"),
            github,
            gitlab: None,
            require_approval: false,
            slack_token: None,
            webhooks: vec![],
        };
        let db = Database::new(&config.db).await.unwrap();
        AppState::new(Arc::new(config), db, VcsClientProxy::default(), reqwest::Client::new())
            .unwrap()
    }

    async fn lock(state: &AppState, path: &str) -> String {
        let project = Project::new("owner/repo", path);
        let pull = PullRequest {
            num: 3,
            url: "https://github.com/owner/repo/pull/3".to_string(),
            ..Default::default()
        };
        let user = User { username: "alice".to_string() };
        state.locker.try_lock(&project, "default", &pull, &user).await.unwrap().lock_id
    }

    async fn send(state: &AppState, method: Method, uri: &str, body: Body) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(body)
            .unwrap();
        app(state.clone()).oneshot(request).await.unwrap()
    }

    async fn text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, None).await;
        let response = send(&state, Method::GET, "/healthz", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_index_lists_locks() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, None).await;
        let response = send(&state, Method::GET, "/", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(text(response).await.contains("No locks found."));

        lock(&state, "infra").await;
        let response = send(&state, Method::GET, "/", Body::empty()).await;
        let body = text(response).await;
        assert!(body.contains("owner/repo"));
        assert!(body.contains("/lock?id=owner%2Frepo%2Finfra%2Fdefault"));
        assert!(body.contains("by alice"));
    }

    #[tokio::test]
    async fn test_lock_detail() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, None).await;
        lock(&state, "infra").await;

        let response =
            send(&state, Method::GET, "/lock?id=owner%2Frepo%2Finfra%2Fdefault", Body::empty())
                .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = text(response).await;
        assert!(body.contains("owner/repo/infra/default"));
        assert!(body.contains("https://github.com/owner/repo/pull/3"));

        let response =
            send(&state, Method::GET, "/lock?id=owner%2Frepo%2Fother%2Fdefault", Body::empty())
                .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&state, Method::GET, "/lock", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_lock() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, None).await;
        let id = lock(&state, "infra").await;

        let uri = "/locks?id=owner%2Frepo%2Finfra%2Fdefault";
        let response = send(&state, Method::DELETE, uri, Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "Deleted lock id owner/repo/infra/default");
        assert_eq!(state.locker.get_lock(&id).await.unwrap(), None);

        let response = send(&state, Method::DELETE, uri, Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_events_without_vcs_headers() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, None).await;
        let response = send(&state, Method::POST, "/events", Body::from("{}")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_plans_requires_github() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, None).await;
        let body = Body::from(r#"{"repo":"owner/repo"}"#);
        let response = send(&state, Method::POST, "/plans", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(text(response).await, "GitHub is not configured");
    }

    #[tokio::test]
    async fn test_plans_rejects_running_plan() {
        let dir = tempfile::tempdir().unwrap();
        let github = GitHubConfig {
            hostname: "github.com".to_string(),
            user: "terrapin-bot".to_string(),
            token: "secret".to_string(),
            webhook_secret: String::new(),
        };
        let state = state(&dir, Some(github)).await;
        let _guard = state.env_locker.try_lock("owner/repo", "staging", 0).unwrap();
        let body = Body::from(r#"{"repo":"owner/repo","workspace":"staging"}"#);
        let response = send(&state, Method::POST, "/plans", body).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = Body::from(r#"{"repo":"not-a-repo"}"#);
        let response = send(&state, Method::POST, "/plans", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
