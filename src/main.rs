mod cli;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cli::{CANCEL_ACTOR, Cli, Command, RETRY_ACTOR};
use fleetq::config::FleetqConfig;
use fleetq::handler::{HandlerRegistry, HttpTradeOfferHandler, TradeOfferCreatePayload};
use fleetq::logging;
use fleetq::service::JobService;
use fleetq::state_machine::JobType;
use fleetq::store::{JobFilter, JobStore, SqliteJobStore};
use fleetq::worker::{JobWorker, RunOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = FleetqConfig::load(cli.config.as_deref())?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    logging::init(config.log_format, cli.verbose);
    let json = cli.json;

    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open job store at {}", config.database_url))?,
    );
    let service =
        JobService::new(store.clone()).with_default_max_attempts(config.default_max_attempts);

    match cli.command {
        Command::EnqueueTrade {
            from_bot,
            to_bot,
            sku,
            amount,
            trade_token,
            app_id,
            context_id,
            message,
            max_attempts,
        } => {
            let payload = TradeOfferCreatePayload {
                from_bot_name: from_bot,
                to_bot_name: to_bot,
                to_bot_trade_token: trade_token,
                app_id,
                context_id,
                sku,
                amount,
                message,
            };
            let job = service.enqueue_trade_offer(payload, max_attempts).await?;
            emit(json, &job, |job| ui::print_job("enqueued", job))?;
        }
        Command::Enqueue {
            job_type,
            payload,
            max_attempts,
        } => {
            let max_attempts = max_attempts.unwrap_or(service.default_max_attempts());
            let job = service.enqueue(job_type, payload, max_attempts).await?;
            emit(json, &job, |job| ui::print_job("enqueued", job))?;
        }
        Command::List {
            status,
            job_type,
            limit,
        } => {
            let jobs = service
                .list_jobs(&JobFilter {
                    job_type,
                    status,
                    limit,
                })
                .await?;
            emit(json, &jobs, |jobs| ui::print_jobs(jobs))?;
        }
        Command::Inspect {
            id,
            transition_limit,
        } => {
            let limit = transition_limit.unwrap_or(config.transition_limit);
            let inspection = service.inspect_job(id, limit).await?;
            emit(json, &inspection, ui::print_inspection)?;
        }
        Command::FailReason { id } => {
            let reason = service.get_fail_reason(id).await?;
            emit(json, &reason, ui::print_fail_reason)?;
        }
        Command::Retry {
            id,
            reason,
            reason_code,
        } => {
            let job = service
                .retry(id, RETRY_ACTOR, reason_code.as_deref(), reason.as_deref())
                .await?;
            emit(json, &job, |job| ui::print_job("requeued", job))?;
        }
        Command::Cancel {
            id,
            reason,
            reason_code,
        } => {
            let job = service
                .cancel(id, CANCEL_ACTOR, reason_code.as_deref(), reason.as_deref())
                .await?;
            emit(json, &job, |job| ui::print_job("canceled", job))?;
        }
        Command::Worker {
            worker_id,
            limit,
            lease_ms,
            once,
            interval_seconds,
        } => {
            let opts = RunOptions {
                worker_id: worker_id.unwrap_or_else(|| config.worker_id.clone()),
                limit: limit.unwrap_or(config.limit),
                lease_ms: lease_ms.unwrap_or(config.lease_ms),
            };
            let worker = JobWorker::new(store.clone(), Arc::new(build_registry(&config)?));

            if once {
                let summary = worker.run_once(&opts, Utc::now()).await?;
                emit(json, &summary, ui::print_summary)?;
            } else {
                let interval =
                    Duration::from_secs(interval_seconds.unwrap_or(config.interval_seconds));
                run_watch(&worker, &opts, interval, json).await?;
            }
        }
    }

    Ok(())
}

async fn run_watch(
    worker: &JobWorker,
    opts: &RunOptions,
    interval: Duration,
    json: bool,
) -> Result<()> {
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                shutdown.cancel();
            }
            Err(err) => warn!(error = %err, "failed to listen for Ctrl-C"),
        }
    });

    let progress = (!json).then(|| ui::WorkerProgress::start(&opts.worker_id));
    let result = worker
        .run_until_cancelled(opts, interval, token, |summary| match &progress {
            Some(progress) => progress.iteration(summary),
            None => {
                if let Ok(line) = serde_json::to_string(summary) {
                    println!("{line}");
                }
            }
        })
        .await;
    if let Some(progress) = &progress {
        progress.finish();
    }
    Ok(result?)
}

// Sem endpoint configurado nenhum handler é registrado.
fn build_registry(config: &FleetqConfig) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    match &config.trade_offer_endpoint {
        Some(endpoint) => {
            let handler = HttpTradeOfferHandler::new(
                endpoint.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )?;
            info!(endpoint = %handler.endpoint(), "trade offer handler registered");
            registry.register(JobType::trade_offer_create(), Arc::new(handler));
        }
        None => warn!("trade_offer_endpoint not set; TRADE_OFFER_CREATE jobs will fail"),
    }
    Ok(registry)
}

fn emit<T: Serialize>(json: bool, value: &T, render: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        render(value);
    }
    Ok(())
}
