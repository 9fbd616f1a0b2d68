mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{Request, StatusCode, header},
};
use terrapin_core::{config::Config, vcs::VcsClient};
use terrapin_db::Database;
use terrapin_events::{
    apply::ApplyExecutor,
    command::CommentParser,
    command_handler::CommandHandler,
    env_locker::EnvLocker,
    locking::LockingClient,
    plan::PlanExecutor,
    pre_execute::ProjectPreExecute,
    project_finder::ProjectFinder,
    pull_closed::PullClosedExecutor,
    terraform::{Terraform, TerraformClient},
    webhooks::MultiWebhookSender,
    workspace::{FileWorkspace, Workspace},
};
use terrapin_vcs::VcsClientProxy;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    locker: LockingClient,
    env_locker: Arc<EnvLocker>,
    command_handler: Arc<CommandHandler>,
    plan_executor: Arc<PlanExecutor>,
    pull_closed: Arc<PullClosedExecutor>,
}

impl AppState {
    /// Wires the executors together on top of the database and VCS clients.
    pub fn new(
        config: Arc<Config>,
        db: Database,
        vcs: VcsClientProxy,
        http: reqwest::Client,
    ) -> Result<Self> {
        let db = Arc::new(db);
        let vcs_client: Arc<dyn VcsClient> = Arc::new(vcs);
        let locker = LockingClient::new(db.clone());
        let terraform: Arc<dyn Terraform> = Arc::new(TerraformClient::default());
        let workspace: Arc<dyn Workspace> = Arc::new(FileWorkspace::new(config.data_dir.clone()));
        let webhooks =
            MultiWebhookSender::new(&config.webhooks, config.slack_token.as_deref(), http)
                .context("Invalid webhooks config")?;
        tracing::info!("Configured {} apply webhooks", webhooks.len());
        let pre_execute = ProjectPreExecute::new(locker.clone(), terraform.clone());
        let plan_executor = Arc::new(PlanExecutor {
            vcs_client: vcs_client.clone(),
            terraform: terraform.clone(),
            workspace: workspace.clone(),
            pre_execute: pre_execute.clone(),
            plan_store: db.clone(),
            project_finder: ProjectFinder,
            server_url: config.server.url.clone(),
        });
        let apply_executor = Arc::new(ApplyExecutor {
            vcs_client: vcs_client.clone(),
            terraform,
            workspace: workspace.clone(),
            pre_execute,
            plan_store: db,
            webhooks: Arc::new(webhooks),
            require_approval: config.require_approval,
        });
        let env_locker = Arc::new(EnvLocker::new());
        let command_handler = Arc::new(CommandHandler {
            plan_executor: plan_executor.clone(),
            apply_executor,
            vcs_client: vcs_client.clone(),
            env_locker: env_locker.clone(),
            parser: CommentParser::new(config.bot_names()),
            bot_users: config.bot_users(),
        });
        let pull_closed =
            Arc::new(PullClosedExecutor { locker: locker.clone(), workspace, vcs_client });
        Ok(Self { config, locker, env_locker, command_handler, plan_executor, pull_closed })
    }
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config: Arc<Config> = {
        let file = BufReader::new(File::open("config.yml").expect("Failed to open config file"));
        serde_yaml::from_reader(file).expect("Failed to parse config file")
    };
    let db = Database::new(&config.db).await.expect("Failed to open database");
    let http = reqwest::Client::builder()
        .user_agent(concat!("terrapin/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
        .expect("Failed to create HTTP client");
    let vcs = VcsClientProxy::new(&config, http.clone()).await.expect("Failed to create VCS clients");
    let state = AppState::new(config.clone(), db.clone(), vcs, http).expect("Failed to set up");

    // Build the router
    let port = config.server.port;
    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();

    // Create the listener
    #[allow(unused_mut)]
    let mut listener = None;
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::{FromRawFd, IntoRawFd};
        let fds = libsystemd::activation::receive_descriptors_with_names(false)
            .expect("Failed to receive fds");
        if let Some((fd, name)) = fds.into_iter().next() {
            tracing::info!("Listening on {}", name);
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd.into_raw_fd()) };
            std_listener.set_nonblocking(true).expect("Failed to set non-blocking");
            listener =
                Some(TcpListener::from_std(std_listener).expect("Failed to create listener"));
        }
    }
    let listener = match listener {
        Some(listener) => listener,
        None => {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            tracing::info!("Listening on {}", addr);
            TcpListener::bind(addr).await.expect("bind error")
        }
    };

    #[cfg(target_os = "linux")]
    {
        libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Ready])
            .expect("Failed to notify");
    }

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Web server error")
    {
        tracing::error!("{e:?}");
    }

    #[cfg(target_os = "linux")]
    {
        libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Stopping])
            .expect("Failed to notify");
    }

    // Commands still running in spawned tasks are abandoned here; their
    // durable locks stay in the database until unlocked.
    db.close().await;
    tracing::info!("Shut down gracefully");
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> = vec![
        header::AUTHORIZATION,
        header::COOKIE,
        header::HeaderName::from_static("x-gitlab-token"),
        header::HeaderName::from_static("x-hub-signature-256"),
    ]
    .into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MyMakeSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(120),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash())
        .compression();
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let result = {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    };
    #[cfg(not(unix))]
    let result = signal::ctrl_c().await;
    if let Err(e) = result {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}

#[derive(Debug, Clone)]
pub struct MyMakeSpan {
    level: Level,
}

impl<B> MakeSpan<B> for MyMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        // Behind a proxy the peer address is the proxy's
        let forwarded_for = request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| IpAddr::from_str(s.trim()).ok());
        let ip = forwarded_for.or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(socket_addr)| socket_addr.ip())
        });
        let ip = ip.unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[unknown]");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    user_agent = %user_agent,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
