//! Configuração do fleetq carregada a partir de `fleetq.toml`.
//!
//! A struct [`FleetqConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `FLEETQ_DATABASE_URL` e
//! `FLEETQ_TRADE_OFFER_ENDPOINT` têm precedência sobre o arquivo.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "fleetq.toml";

/// Formato da saída de logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Configuração de nível superior carregada de `fleetq.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FleetqConfig {
    /// URL do banco SQLite que guarda jobs e transições.
    pub database_url: String,

    /// Identidade padrão do worker.
    pub worker_id: String,

    /// Máximo de jobs recuperados e reivindicados por iteração.
    pub limit: usize,

    /// Duração do lease em milissegundos.
    pub lease_ms: u64,

    /// Intervalo entre iterações no modo contínuo.
    pub interval_seconds: u64,

    /// Tentativas máximas usadas quando o enqueue não informa outro valor.
    pub default_max_attempts: u32,

    /// Quantidade de transições exibidas pelo `inspect`.
    pub transition_limit: usize,

    /// Endpoint do gateway de trade offers. Sem ele nenhum handler é registrado.
    pub trade_offer_endpoint: Option<String>,

    /// Timeout das requisições HTTP ao gateway, em segundos.
    pub request_timeout_secs: u64,

    pub log_format: LogFormat,
}

impl Default for FleetqConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://fleetq.db".to_string(),
            worker_id: "worker-1".to_string(),
            limit: 10,
            lease_ms: 30_000,
            interval_seconds: 5,
            default_max_attempts: 5,
            transition_limit: 20,
            trade_offer_endpoint: None,
            request_timeout_secs: 30,
            log_format: LogFormat::Text,
        }
    }
}

impl FleetqConfig {
    /// Carrega `fleetq.toml` do diretório atual, ou `path` quando informado.
    /// Um arquivo explícito ausente é erro; o arquivo padrão ausente não.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = toml::from_str::<FleetqConfig>(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("FLEETQ_DATABASE_URL")
            && !url.is_empty()
        {
            self.database_url = url;
        }
        if let Some(endpoint) = lookup("FLEETQ_TRADE_OFFER_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.trade_offer_endpoint = Some(endpoint);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            bail!("limit must be a positive integer");
        }
        if self.lease_ms == 0 {
            bail!("lease_ms must be a positive integer");
        }
        if self.interval_seconds == 0 {
            bail!("interval_seconds must be a positive integer");
        }
        if self.default_max_attempts == 0 {
            bail!("default_max_attempts must be a positive integer");
        }
        if self.transition_limit == 0 {
            bail!("transition_limit must be a positive integer");
        }
        Ok(())
    }
}
