use git_sync_deploy::config::{Settings, load_config};
use git_sync_deploy::error::DeployError;
use git_sync_deploy::github::GithubClient;
use git_sync_deploy::logging::setup_logging;
use git_sync_deploy::process::SystemRunner;
use git_sync_deploy::reconcile::Reconciler;
use git_sync_deploy::{AppState, api};
use std::sync::Arc;
use tracing::info;

async fn run(settings: Settings) -> Result<(), DeployError> {
    let runner = Arc::new(SystemRunner);
    let github = GithubClient::new(&settings.github_api_url, &settings.github_token);

    let config_path = settings.config_path();
    info!("Using config at {:?}", config_path);
    let repos = load_config(&config_path).await?;
    Reconciler::new(&settings, runner.as_ref(), &github)
        .reconcile_all(&repos)
        .await?;

    let bind_address = format!("0.0.0.0:{}", settings.port);
    let app = api::router(Arc::new(AppState::new(settings, runner)));

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on {}", bind_address);
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match setup_logging(settings.log_dir.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(settings).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
