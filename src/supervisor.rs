//! Wires configuration into running repositories: for each configured
//! repository, ensures a working copy and target namespace exist, starts
//! its engine's poller, and serves the shared webhook/metrics HTTP
//! endpoint. Runs until `SIGINT`/`SIGTERM`, then stops every poller and
//! waits for in-flight syncs to finish before returning.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::Client;

use crate::cluster::ClusterClient;
use crate::config::Config;
use crate::engine::{Engine, RetryPolicy};
use crate::error::Result;
use crate::poller::Poller;
use crate::webhook;

pub async fn run(config: Config) -> Result<()> {
    let kube_client = build_kube_client(&config).await?;

    let mut pollers = Vec::new();
    let mut triggers = BTreeMap::new();

    for repo_config in &config.repositories {
        let cluster = ClusterClient::new(kube_client.clone());
        let engine = Arc::new(Engine::new(repo_config, cluster));

        engine.ensure_clone()?;
        engine.ensure_namespace().await?;

        let poller = Arc::new(Poller::new(
            engine.clone(),
            repo_config.interval,
            RetryPolicy::default(),
        ));
        triggers.insert(repo_config.name.clone(), poller.trigger());
        pollers.push(poller);
    }

    let mut tasks = Vec::new();
    for poller in &pollers {
        let poller = poller.clone();
        tasks.push(tokio::spawn(async move { poller.run().await }));
    }

    if config.webhook.enabled {
        let secret = config.webhook.secret.clone().map(Arc::new);
        let triggers: webhook::Triggers = Arc::new(triggers);
        let routes = webhook::routes(triggers, secret);
        let port = config.webhook.port;
        let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(
            ([0, 0, 0, 0], port),
            shutdown_signal(),
        );
        tasks.push(tokio::spawn(server));
        tracing::info!(port, "webhook server listening");
    } else {
        shutdown_signal().await;
    }

    for poller in &pollers {
        poller.cancel_token().cancel();
    }
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

async fn build_kube_client(config: &Config) -> Result<Client> {
    let client = match &config.kubernetes.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            let kube_config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?;
            Client::try_from(kube_config)?
        }
        None => Client::try_default().await?,
    };
    Ok(client)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
