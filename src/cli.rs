//! Interface de linha de comando do fleetq baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] para operar a fila
//! (enqueue, list, inspect, retry, cancel) e rodar o worker, além de flags
//! globais (--config, --database-url, --json, --verbose).

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use fleetq::state_machine::{JobStatus, JobType};

/// Ator registrado nas transições feitas pelo `retry`.
pub const RETRY_ACTOR: &str = "cli:job.retry";
/// Ator registrado nas transições feitas pelo `cancel`.
pub const CANCEL_ACTOR: &str = "cli:job.cancel";

/// fleetq: agendador durável de jobs para a frota de bots.
#[derive(Debug, Parser)]
#[command(name = "fleetq", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração (padrão: ./fleetq.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// URL do banco SQLite; sobrepõe a configuração.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Imprime JSON em vez de tabelas.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enfileira um job TRADE_OFFER_CREATE.
    EnqueueTrade {
        /// Bot que envia a oferta.
        #[arg(long = "from")]
        from_bot: String,

        /// Bot que recebe a oferta.
        #[arg(long = "to")]
        to_bot: String,

        /// SKU do item negociado.
        #[arg(long)]
        sku: String,

        /// Quantidade de itens.
        #[arg(long, value_parser = positive::<u32>)]
        amount: u32,

        /// Trade token do bot de destino.
        #[arg(long)]
        trade_token: Option<String>,

        #[arg(long, default_value_t = 440)]
        app_id: u32,

        #[arg(long, default_value = "2")]
        context_id: String,

        /// Mensagem anexada à oferta.
        #[arg(long)]
        message: Option<String>,

        /// Tentativas máximas (padrão: configuração).
        #[arg(long, value_parser = positive::<u32>)]
        max_attempts: Option<u32>,
    },

    /// Enfileira um job de qualquer tipo com payload JSON.
    Enqueue {
        /// Tipo do job (case-insensitive).
        #[arg(long = "type")]
        job_type: JobType,

        /// Payload em JSON.
        #[arg(long, default_value = "{}")]
        payload: serde_json::Value,

        #[arg(long, value_parser = positive::<u32>)]
        max_attempts: Option<u32>,
    },

    /// Lista jobs, ordenados por próxima execução.
    List {
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long = "type")]
        job_type: Option<JobType>,

        #[arg(long, default_value_t = 50, value_parser = positive::<usize>)]
        limit: usize,
    },

    /// Mostra um job e suas transições mais recentes.
    Inspect {
        #[arg(long)]
        id: Uuid,

        #[arg(long, value_parser = positive::<usize>)]
        transition_limit: Option<usize>,
    },

    /// Mostra o motivo da última falha de um job.
    FailReason {
        #[arg(long)]
        id: Uuid,
    },

    /// Reenfileira um job FAILED.
    Retry {
        #[arg(long)]
        id: Uuid,

        /// Mensagem registrada na transição.
        #[arg(long)]
        reason: Option<String>,

        /// Código de motivo (padrão: manual_retry).
        #[arg(long)]
        reason_code: Option<String>,
    },

    /// Cancela um job PENDING ou RETRY_WAIT.
    Cancel {
        #[arg(long)]
        id: Uuid,

        #[arg(long)]
        reason: Option<String>,

        /// Código de motivo (padrão: canceled_by_operator).
        #[arg(long)]
        reason_code: Option<String>,
    },

    /// Executa o worker, uma vez ou continuamente até Ctrl-C.
    Worker {
        #[arg(long)]
        worker_id: Option<String>,

        #[arg(long, value_parser = positive::<usize>)]
        limit: Option<usize>,

        #[arg(long, value_parser = positive::<u64>)]
        lease_ms: Option<u64>,

        /// Executa uma única iteração e sai.
        #[arg(long, default_value_t = false)]
        once: bool,

        #[arg(long, value_parser = positive::<u64>)]
        interval_seconds: Option<u64>,
    },
}

// Aceita apenas inteiros positivos.
fn positive<T>(s: &str) -> Result<T, String>
where
    T: FromStr + Default + PartialEq,
{
    let value: T = s
        .trim()
        .parse()
        .map_err(|_| format!("`{s}` is not a positive integer"))?;
    if value == T::default() {
        return Err(format!("`{s}` is not a positive integer"));
    }
    Ok(value)
}
