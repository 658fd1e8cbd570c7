//! Inicialização do tracing.

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Instala o subscriber global. Logs vão para stderr para que a saída dos
/// comandos em stdout continue legível por máquina.
///
/// `RUST_LOG` tem precedência; caso contrário `info`, ou `debug` com `verbose`.
/// Chamadas repetidas não têm efeito.
pub fn init(format: LogFormat, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init(),
    };
}
