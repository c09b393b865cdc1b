use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use crate::client::{Service, ServiceHandle};
use crate::config::ClientFullConfig;

use super::config::{check_config, collect_sources, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli, shutdown: CancellationToken) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Run {
            config,
            config_dir,
            token,
            tunnel_id,
            api,
        } => {
            let sources = collect_sources(
                config,
                config_dir.as_deref(),
                token.as_deref(),
                tunnel_id,
                api,
            )?;
            run_services(sources, shutdown).await?;
        }
    }

    Ok(())
}

/// 每个配置启动一个独立的客户端实例，全部结束后返回第一个错误
async fn run_services(
    sources: Vec<crate::config::ConfigSource>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut services = Vec::with_capacity(sources.len());
    for source in &sources {
        let config = ClientFullConfig::load(source)
            .await
            .with_context(|| format!("Failed to load configuration from {:?}", source))?;
        let service = Service::new(config)
            .with_context(|| format!("Failed to create client for {:?}", source))?;
        services.push(service);
    }

    info!("Starting {} client instance(s)", services.len());

    let handles: Vec<ServiceHandle> = services.iter().map(Service::handle).collect();
    let mut tasks = JoinSet::new();
    for (index, service) in services.into_iter().enumerate() {
        let span = tracing::info_span!("instance", id = index);
        tasks.spawn(service.run().instrument(span));
    }

    let mut first_error: Option<anyhow::Error> = None;
    let mut remaining = tasks.len();
    while remaining > 0 {
        tokio::select! {
            _ = shutdown.cancelled(), if !handles.iter().all(ServiceHandle::is_shutdown) => {
                info!("Shutting down {} client instance(s)", handles.len());
                for handle in &handles {
                    handle.shutdown();
                }
            }
            joined = tasks.join_next() => {
                let Some(joined) = joined else { break };
                remaining -= 1;
                let outcome = joined
                    .context("Client task panicked")
                    .and_then(|result| result.map_err(anyhow::Error::from));
                if let Err(e) = outcome {
                    error!("Client instance exited: {:#}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
