use presence_ledger::logger::*;
use presence_ledger::settings::Log;

fn main() -> anyhow::Result<()> {
    let logger = Logger::new_bootstrap();
    trace!("bootstrap trace log");
    debug!("bootstrap debug log");
    info!("bootstrap info log");

    let config = LogConfig::from(&Log {
        filter: "presence_ledger=trace,debug".to_string(),
    });
    logger.reload_from_config(&config)?;
    trace!("application trace log");
    debug!("application debug log");
    info!("application info log");

    let bad = LogConfig {
        filter: "presence_ledger=loud".to_string(),
    };
    warn!(rejected = logger.reload_from_config(&bad).is_err(), "invalid filter");

    Ok(())
}
