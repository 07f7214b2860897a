mod attendance;
mod auth;
mod buildings;
mod careers;
mod config;
mod dashboard;
mod error;
mod groups;
mod model;
mod schedules;
mod schema;
mod session;
mod subjects;
mod timetable;
mod users;
mod validate;

use std::sync::Arc;

use auth::{Keys, SecurityAddon};
use axum::extract::FromRef;
use axum::Router;
use casbin::{CoreApi, Enforcer};
use config::Config;
use diesel::{pg::Pg, Connection, PgConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tokio::net::TcpListener;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

const SESSION_TAG: &str = "session";
const USERS_TAG: &str = "users";
const CAREERS_TAG: &str = "careers";
const SUBJECTS_TAG: &str = "subjects";
const GROUPS_TAG: &str = "groups";
const BUILDINGS_TAG: &str = "buildings";
const SCHEDULES_TAG: &str = "schedules";
const ATTENDANCE_TAG: &str = "attendance";
const DASHBOARD_TAG: &str = "dashboard";

type Pool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pool: Pool,
    enforcer: Arc<Enforcer>,
    keys: Arc<Keys>,
}

impl FromRef<AppState> for Arc<Keys> {
    fn from_ref(state: &AppState) -> Self {
        state.keys.clone()
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    tags(
        (name = SESSION_TAG, description = "Sign-in and session endpoints"),
        (name = USERS_TAG, description = "User administration"),
        (name = CAREERS_TAG, description = "Careers"),
        (name = SUBJECTS_TAG, description = "Subjects"),
        (name = GROUPS_TAG, description = "Groups, classrooms and group leaders"),
        (name = BUILDINGS_TAG, description = "Buildings"),
        (name = SCHEDULES_TAG, description = "Weekly class schedules and timetables"),
        (name = ATTENDANCE_TAG, description = "Attendance marking and reports"),
        (name = DASHBOARD_TAG, description = "Administrator overview")
    )
)]
struct ApiDoc;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

fn run_migrations(
    connection: &mut impl MigrationHarness<Pg>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    connection.run_pending_migrations(MIGRATIONS)?;
    Ok(())
}

fn app(state: AppState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .merge(session::router())
        .merge(users::router())
        .merge(careers::router())
        .merge(subjects::router())
        .merge(groups::router())
        .merge(buildings::router())
        .merge(schedules::router())
        .merge(attendance::router())
        .merge(dashboard::router())
        .with_state(state)
        .split_for_parts();

    router.merge(SwaggerUi::new("/swagger-ui").url("/apidoc/openapi.json", api))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_filter(filter),
        )
        .init();

    let config = Config::from_env()?;

    let mut migration_connection = PgConnection::establish(&config.database_url)?;
    run_migrations(&mut migration_connection)?;
    drop(migration_connection);
    // set up connection pool
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool = bb8::Pool::builder().build(manager).await?;

    if let Some(seed) = &config.admin {
        users::ensure_admin(&pool, seed)
            .await
            .map_err(|e| format!("creating the first administrator: {e}"))?;
    }

    let acl_model: &'static str = config.acl_model.clone().leak();
    let acl_policy: &'static str = config.acl_policy.clone().leak();
    let enforcer = Enforcer::new(acl_model, acl_policy)
        .await
        .map_err(|e| format!("loading access policy: {e}"))?;

    let router = app(AppState {
        pool,
        enforcer: Arc::new(enforcer),
        keys: Arc::new(Keys::new(&config.jwt_secret, config.token_ttl_hours)),
    });

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);
    Ok(axum::serve(listener, router).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use chrono::NaiveDate;
    use tower::ServiceExt;

    use crate::model::{Role, UserProfile};

    const SECRET: &str = "test-secret";

    /// App over a pool that never connects; only paths decided before any query can be exercised.
    async fn test_app() -> Router {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(
            "postgres://nobody@127.0.0.1:1/none",
        );
        let pool = bb8::Pool::builder().build_unchecked(manager);
        let enforcer = Enforcer::new("acl/model.conf", "acl/policy.csv")
            .await
            .unwrap();
        app(AppState {
            pool,
            enforcer: Arc::new(enforcer),
            keys: Arc::new(Keys::new(SECRET, 1)),
        })
    }

    fn token(role: Role) -> String {
        let user = UserProfile {
            user_id: 1,
            full_name: "Test".into(),
            email: "test@school.test".into(),
            account_number: Some("1001".into()),
            role,
            created_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        };
        Keys::new(SECRET, 1).issue(&user).unwrap()
    }

    fn request(method: &str, uri: &str, role: Option<Role>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(role) = role {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token(role)));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn error_of(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        json["error"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn requests_without_a_token_are_unauthorized() {
        let response = test_app()
            .await
            .oneshot(request("GET", "/api/users/list", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_of(response).await, "Missing credentials");
    }

    #[tokio::test]
    async fn forged_tokens_are_rejected() {
        let response = test_app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/api/dashboard")
                    .header(header::AUTHORIZATION, "Bearer not.a.token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_of(response).await, "Invalid token");
    }

    #[tokio::test]
    async fn students_cannot_manage_users() {
        let body = r#"{"full_name": "Eve", "email": "eve@school.test", "password": "x", "role": "administrator"}"#;
        let response = test_app()
            .await
            .oneshot(request("POST", "/api/users", Some(Role::Student), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_of(response).await, "Permission denied");
    }

    #[tokio::test]
    async fn only_administrators_see_the_dashboard() {
        for role in [Role::Teacher, Role::GroupLeader, Role::Checker, Role::Student] {
            let response = test_app()
                .await
                .oneshot(request("GET", "/api/dashboard", Some(role), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{role}");
        }
    }

    #[tokio::test]
    async fn students_cannot_mark_attendance() {
        let body = r#"{"slot_id": 1, "date": "2024-11-18", "status": "present"}"#;
        let response = test_app()
            .await
            .oneshot(request("POST", "/api/attendance", Some(Role::Student), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn invalid_bodies_are_rejected_before_any_query() {
        let login = test_app()
            .await
            .oneshot(request(
                "POST",
                "/api/session/login",
                None,
                Some(r#"{"email": "", "password": ""}"#),
            ))
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(error_of(login).await.contains("email is required"));

        let slot = r#"{"teacher_id": 1, "subject_id": 1, "group_id": 1, "day": "monday", "hour": 22}"#;
        let response = test_app()
            .await
            .oneshot(request("POST", "/api/schedules", Some(Role::Administrator), Some(slot)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(error_of(response)
            .await
            .contains("classes start between 07:00 and 19:00"));

        let weekend = r#"{"teacher_id": 1, "subject_id": 1, "group_id": 1, "day": "saturday", "hour": 9}"#;
        let response = test_app()
            .await
            .oneshot(request("POST", "/api/schedules", Some(Role::Administrator), Some(weekend)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!error_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn invalid_bodies_use_the_error_envelope() {
        let response = test_app()
            .await
            .oneshot(request(
                "POST",
                "/api/careers",
                Some(Role::Administrator),
                Some(r#"{"name": "", "semester_count": 3}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let message = error_of(response).await;
        assert!(message.contains("career name is required"), "{message}");
        assert!(!message.starts_with("Failed to deserialize"));
    }

    #[tokio::test]
    async fn weekend_sheets_are_empty() {
        let response = test_app()
            .await
            .oneshot(request(
                "GET",
                "/api/attendance/daily?date=2024-11-23",
                Some(Role::Checker),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let sheet: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(sheet["recorder"], "checker");
        assert_eq!(sheet["entries"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn access_policy_matches_roles() {
        let enforcer = Enforcer::new("acl/model.conf", "acl/policy.csv")
            .await
            .unwrap();
        let keys = Keys::new(SECRET, 1);
        let claims = |role| keys.verify(&token(role)).unwrap();

        let admin = claims(Role::Administrator);
        for object in ["user", "career", "schedule", "attendance", "dashboard"] {
            assert!(admin.authorize(&enforcer, object, "delete").is_ok());
        }

        let leader = claims(Role::GroupLeader);
        assert!(leader.authorize(&enforcer, "attendance", "mark").is_ok());
        assert!(leader.authorize(&enforcer, "schedule", "read").is_ok());
        assert!(leader.authorize(&enforcer, "attendance", "report").is_err());

        let checker = claims(Role::Checker);
        assert!(checker.authorize(&enforcer, "building", "read").is_ok());
        assert!(checker.authorize(&enforcer, "group", "update").is_err());

        let student = claims(Role::Student);
        assert!(student.authorize(&enforcer, "subject", "read").is_ok());
        assert!(student.authorize(&enforcer, "attendance", "read").is_err());
        assert!(student.authorize(&enforcer, "user", "read").is_err());
    }

    #[tokio::test]
    async fn openapi_document_lists_every_module() {
        let response = test_app()
            .await
            .oneshot(request("GET", "/apidoc/openapi.json", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        for path in [
            "/api/session/login",
            "/api/users",
            "/api/careers/list",
            "/api/subjects/list",
            "/api/groups/leader",
            "/api/buildings",
            "/api/schedules/group",
            "/api/attendance/report",
            "/api/dashboard",
        ] {
            assert!(doc["paths"].get(path).is_some(), "{path} missing");
        }
    }
}
