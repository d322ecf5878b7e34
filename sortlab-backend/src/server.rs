use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::get};
use camino::Utf8PathBuf;
use diesel_async::{
    AsyncPgConnection, RunQueryDsl,
    async_connection_wrapper::AsyncConnectionWrapper,
    pooled_connection::{
        AsyncDieselConnectionManager,
        deadpool::{Object, Pool},
    },
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use util::DevContainer;
use uuid::Uuid;

use crate::{
    config::{Config, LOGIN_USER},
    db,
    equipment::{XmlRpcLink, sequencer::SortingSequencer},
};

mod api;
mod auth;
pub mod util;

/// # Errors
pub async fn serve(mut config: Config, log_dir: Option<Utf8PathBuf>) -> anyhow::Result<()> {
    initialize_logging(log_dir);

    config
        .read_secrets()
        .context("failed to read secrets directory")?;
    let app_addr = config.app_address();

    let cancel = CancellationToken::new();

    let mut app_state = AppState::new(config, cancel.clone())
        .await
        .context("failed to initialize app state")?;
    tracing::info!("initialized app state");

    let db_root_conn = app_state
        .db_root_conn()
        .await
        .context("failed to connect to database as root")?;

    run_migrations(db_root_conn)
        .await
        .context("failed to run database migrations")?;
    tracing::info!("ran database migrations");

    app_state
        .set_login_user_password()
        .await
        .context("failed to set password for login_user")?;

    app_state
        .write_seed_data()
        .await
        .context("failed to insert seed data")?;
    tracing::info!("inserted seed data");

    app_state.drop_db_root_pool();

    let app = app(app_state.clone());

    let listener = TcpListener::bind(&app_addr)
        .await
        .context(format!("failed to listen on {app_addr}"))?;
    tracing::info!("sortlab listening on {app_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state, cancel))
        .await
        .context("failed to serve app")?;

    Ok(())
}

fn initialize_logging(log_dir: Option<Utf8PathBuf>) {
    use tracing::Level;
    use tracing_subscriber::{filter::Targets, prelude::*};

    let log_layer = tracing_subscriber::fmt::layer();

    // A subscriber may already be installed when several servers share a process, as in tests
    let result = match log_dir {
        None => {
            let dev_test_log_filter = Targets::new()
                .with_target("sortlab_backend", Level::DEBUG)
                .with_target("tower_http", Level::TRACE);
            let log_layer = log_layer.pretty().with_filter(dev_test_log_filter);

            tracing_subscriber::registry().with(log_layer).try_init()
        }
        Some(path) => {
            let log_writer = tracing_appender::rolling::daily(path, "sortlab.log");
            let prod_log_filter = Targets::new()
                .with_target("sortlab_backend", Level::INFO)
                .with_target("tower_http", Level::INFO);
            let log_layer = log_layer
                .json()
                .with_writer(log_writer)
                .with_filter(prod_log_filter);

            tracing_subscriber::registry().with(log_layer).try_init()
        }
    };

    if let Err(err) = result {
        tracing::debug!("logging already initialized: {err}");
    }
}

type Sequencer = Arc<SortingSequencer<XmlRpcLink>>;

#[derive(Clone)]
pub(crate) enum AppState {
    Dev {
        db_pool: Pool<AsyncPgConnection>,
        _pg_container: Arc<DevContainer>,
        sequencer: Sequencer,
        config: Arc<Config>,
    },
    Prod {
        db_pool: Pool<AsyncPgConnection>,
        db_root_pool: Option<Pool<AsyncPgConnection>>,
        sequencer: Sequencer,
        config: Arc<Config>,
    },
}

impl AppState {
    async fn new(config: Config, cancel: CancellationToken) -> anyhow::Result<Self> {
        let equipment = config.equipment();
        let link = XmlRpcLink::new(equipment.endpoint()?, equipment.timeout(), cancel);
        tracing::info!(endpoint = %link.endpoint(), "configured equipment link");
        let sequencer = Arc::new(SortingSequencer::new(link, equipment.sequencer_settings()));

        let state = if config.is_dev() {
            let pg_container = DevContainer::new("sortlab-backend_dev", false)
                .await
                .context("failed to start postgres container instance")?;
            let db_root_url = pg_container.db_url();

            let db_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&db_root_url);
            let db_pool = Pool::builder(db_config).build()?;

            Self::Dev {
                db_pool,
                _pg_container: Arc::new(pg_container),
                sequencer,
                config: Arc::new(config),
            }
        } else {
            let db_config =
                AsyncDieselConnectionManager::<AsyncPgConnection>::new(config.db_login_url());
            let db_pool = Pool::builder(db_config).build()?;

            let db_root_config =
                AsyncDieselConnectionManager::<AsyncPgConnection>::new(config.db_root_url());
            let db_root_pool = Some(Pool::builder(db_root_config).max_size(1).build()?);

            Self::Prod {
                db_pool,
                db_root_pool,
                sequencer,
                config: Arc::new(config),
            }
        };

        Ok(state)
    }

    pub(crate) async fn db_conn(&self) -> db::Result<Object<AsyncPgConnection>> {
        use AppState::{Dev, Prod};

        match self {
            Dev { db_pool, .. } | Prod { db_pool, .. } => Ok(db_pool.get().await?),
        }
    }

    async fn db_root_conn(&self) -> db::Result<Object<AsyncPgConnection>> {
        use AppState::Prod;

        let Prod { db_root_pool, .. } = self else {
            return self.db_conn().await;
        };

        let Some(db_root_pool) = db_root_pool else {
            return Err(db::Error::Other {
                message: "root user connection to database should not be required at this stage"
                    .to_string(),
            });
        };

        Ok(db_root_pool.get().await?)
    }

    pub(crate) fn sequencer(&self) -> &SortingSequencer<XmlRpcLink> {
        use AppState::{Dev, Prod};

        match self {
            Dev { sequencer, .. } | Prod { sequencer, .. } => sequencer,
        }
    }

    pub(crate) fn config(&self) -> &Config {
        use AppState::{Dev, Prod};

        match self {
            Dev { config, .. } | Prod { config, .. } => config,
        }
    }

    async fn set_login_user_password(&self) -> anyhow::Result<()> {
        let password = match self {
            AppState::Dev { .. } => Uuid::now_v7().to_string(),
            AppState::Prod { config, .. } => config.db_login_user_password().replace('\'', "''"),
        };

        let mut db_conn = self.db_root_conn().await?;
        diesel::sql_query(format!(
            r#"alter user "{LOGIN_USER}" with password '{password}'"#
        ))
        .execute(&mut db_conn)
        .await?;

        Ok(())
    }

    async fn write_seed_data(&self) -> anyhow::Result<()> {
        let mut db_conn = self.db_root_conn().await?;

        let seed_data = self.config().seed_data()?;
        seed_data.write(&mut db_conn).await
    }

    fn drop_db_root_pool(&mut self) {
        use AppState::{Dev, Prod};

        match self {
            Dev { .. } => (),
            Prod { db_root_pool, .. } => {
                *db_root_pool = None;
            }
        }
    }
}

pub(crate) async fn run_migrations(db_conn: Object<AsyncPgConnection>) -> anyhow::Result<()> {
    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../db/migrations");

    let mut wrapper: AsyncConnectionWrapper<Object<AsyncPgConnection>> =
        AsyncConnectionWrapper::from(db_conn);

    tokio::task::spawn_blocking(move || {
        wrapper
            .run_pending_migrations(MIGRATIONS)
            .map(|_| ())
            .map_err(|err| anyhow::anyhow!(err))
    })
    .await??;

    Ok(())
}

fn app(app_state: AppState) -> Router {
    api::router()
        .layer(TraceLayer::new_for_http())
        .route("/health", get(async || ()))
        .with_state(app_state)
}

async fn shutdown_signal(app_state: AppState, cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutting down");

    // In-flight equipment calls are abandoned rather than awaited
    cancel.cancel();
    drop(app_state);
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string_contains, method},
    };

    use super::{AppState, app};
    use crate::config::{Config, FRONTEND_USER};

    const FRONTEND_TOKEN: &str = "shared-secret";

    // Equipment-only state. The database pools are never connected
    async fn app_state(equipment: &MockServer) -> AppState {
        let address = equipment.address();

        let config: Config = serde_json::from_value(json!({
            "db_root_user": "postgres",
            "db_root_password": "",
            "db_login_user_password": "",
            "db_host": "localhost",
            "db_port": 5432,
            "db_name": "sortlab",
            "frontend_token": FRONTEND_TOKEN,
            "host": "localhost",
            "port": 8000,
            "equipment": {"host": address.ip().to_string(), "port": address.port(), "timeout_secs": 2}
        }))
        .unwrap();

        AppState::new(config, CancellationToken::new()).await.unwrap()
    }

    fn lab_request(method: &str, uri: &str) -> Request<Body> {
        use axum_extra::headers::{Authorization, HeaderMapExt};

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-Sortlab-Role", "lab")
            .body(Body::empty())
            .unwrap();
        request
            .headers_mut()
            .typed_insert(Authorization::basic(FRONTEND_USER, FRONTEND_TOKEN));

        request
    }

    async fn send(state: AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = app(state).oneshot(request).await.unwrap();
        let status = response.status();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };

        (status, body)
    }

    fn xml_reply(value: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_string(format!(
            "<?xml version='1.0'?><methodResponse><params><param><value>{value}</value></param></params></methodResponse>"
        ))
    }

    #[tokio::test]
    async fn health_needs_no_credentials() {
        let equipment = MockServer::start().await;

        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, _) = send(app_state(&equipment).await, request).await;

        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_credentials_are_unauthorized() {
        let equipment = MockServer::start().await;

        let request = Request::post("/sorting/start").body(Body::empty()).unwrap();
        let (status, body) = send(app_state(&equipment).await, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            body,
            json!({"status": 401, "error": {"type": "invalid_frontend_credentials"}})
        );
    }

    #[tokio::test]
    async fn non_lab_role_is_forbidden() {
        let equipment = MockServer::start().await;

        let mut request = lab_request("POST", "/sorting/start");
        request
            .headers_mut()
            .insert("X-Sortlab-Role", header::HeaderValue::from_static("admin"));
        let (status, _) = send(app_state(&equipment).await, request).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn start_sorting_returns_raw_reply() {
        let equipment = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("<int>2101</int>"))
            .respond_with(xml_reply("<boolean>1</boolean>"))
            .expect(1)
            .mount(&equipment)
            .await;

        let (status, body) = send(
            app_state(&equipment).await,
            lab_request("POST", "/sorting/start"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(true));
    }

    #[tokio::test]
    async fn reset_returns_replies_by_role() {
        let equipment = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(xml_reply("<boolean>1</boolean>"))
            .expect(4)
            .mount(&equipment)
            .await;

        let (status, body) = send(
            app_state(&equipment).await,
            lab_request("GET", "/sorting/reset"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "plcResponse": true,
                "urResponse": true,
                "dataResponse": true,
                "rampResponse": true
            })
        );
    }

    #[tokio::test]
    async fn failed_stop_is_bad_gateway_with_report() {
        let equipment = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&equipment)
            .await;

        let (status, body) = send(
            app_state(&equipment).await,
            lab_request("POST", "/sorting/stop"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "equipment");
        assert_eq!(body["error"]["index"], 1);
        assert_eq!(body["error"]["step"], "stop_conveyor");
        assert_eq!(body["error"]["cause"]["type"], "transport");
        assert_eq!(body["error"]["report"]["steps"][1]["status"], "not_attempted");
    }

    #[tokio::test]
    async fn malformed_placement_body_is_rejected() {
        let equipment = MockServer::start().await;

        let mut request = lab_request("POST", "/racks/1/slot/3");
        *request.body_mut() = Body::from(r#"{"sampleId": "not a number"}"#);
        request.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let (status, body) = send(app_state(&equipment).await, request).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "malformed_request");
    }

    #[tokio::test]
    async fn non_numeric_position_is_bad_request() {
        let equipment = MockServer::start().await;

        let mut request = lab_request("POST", "/racks/1/slot/three");
        *request.body_mut() = Body::from(r#"{"sampleId": 4}"#);
        request.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let (status, body) = send(app_state(&equipment).await, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "malformed_request");
    }

    fn placement_request(uri: &str) -> Request<Body> {
        let mut request = lab_request("POST", uri);
        *request.body_mut() = Body::from(r#"{"sampleId": 4}"#);
        request.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        request
    }

    // The database behind `app_state` is unreachable, so these must be rejected before any query
    #[rstest]
    #[case(placement_request("/racks/1/slot/11"))]
    #[case(placement_request("/racks/1/slot/0"))]
    #[case(placement_request("/racks/1/slot/40000"))]
    #[case(placement_request("/racks/1/slot/-2147483648"))]
    #[case(lab_request("DELETE", "/racks/1/slot/11"))]
    #[case(lab_request("DELETE", "/racks/1/slot/99999"))]
    #[tokio::test]
    async fn position_outside_rack_is_a_validation_error(#[case] request: Request<Body>) {
        let equipment = MockServer::start().await;

        let (status, body) = send(app_state(&equipment).await, request).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], 422);
        assert_eq!(body["kind"], "validation");
    }
}
