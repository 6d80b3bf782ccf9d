//! Server bootstrap: bind, register with the kernel, serve, unregister.

use std::sync::Arc;

use anyhow::{Context, Result};
use relay::Executor;
use tower_http::cors::{Any, CorsLayer};

use crate::configuration::Settings;
use crate::registration::Registrar;
use crate::routes;
use crate::state::AppState;

pub async fn run(settings: Settings, executor: Arc<dyn Executor>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .context("failed to bind")?;
    let port = listener.local_addr()?.port();
    let scheme = if settings.https { "https" } else { "http" };
    let endpoint = format!(
        "{}://{}:{}{}",
        scheme, settings.host, port, settings.executor_path
    );

    let state = AppState::new(
        executor,
        settings.concurrent_req_limit,
        settings.in_debug(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = routes::configure(state.clone(), &settings.executor_path).layer(cors);

    let registrar = Registrar::new(
        &settings.kernel_url,
        endpoint.clone(),
        settings.access_codes.clone(),
    )?;
    let registered = if settings.ignore_kernel {
        false
    } else {
        if let Err(e) = registrar.register_all().await {
            // An unregistered executor can never receive work.
            tracing::error!("failed to register with the kernel: {:#}", e);
            tracing::info!("the process will exit now");
            std::process::exit(1);
        }
        true
    };

    let shutdown = state.shutdown.clone();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        }
    });

    tracing::info!("listening on {}", endpoint);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    if registered {
        registrar.unregister_all().await;
    }
    Ok(())
}
