//! R0N MQTT binary: runs the engine with a broker listener.
//!
//! Usage: `r0n-mqtt [config.toml]`. Without a path the file named by
//! `R0N_MQTT_CONFIG` is read, else the defaults apply. `R0N_MQTT_BIND`
//! overrides the listen address.

use r0n_mqtt::broker::{BrokerServer, MockBroker};
use r0n_mqtt::config::{BasicValidator, ConfigLoader, ConfigSource, BIND_ENV, CONFIG_ENV};
use r0n_mqtt::logging;
use r0n_mqtt::reactor::{ChannelManager, EngineStatus};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let source = ConfigSource::from_args(std::env::args_os().skip(1), std::env::var_os(CONFIG_ENV))?;
    let config = ConfigLoader::new()
        .with_validator(BasicValidator::new())
        .with_bind_override(std::env::var(BIND_ENV).ok())
        .load(&source)?;
    logging::init(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        engine = %config.engine.name,
        "Starting r0n-mqtt"
    );

    let stats_interval = config.engine.stats_interval;
    let manager = ChannelManager::init(config.engine.clone())?;
    let broker = Arc::new(MockBroker::new(config.broker.clone()));
    let server = BrokerServer::bind(&config.broker.bind, manager.clone(), broker)?;
    info!(address = %server.local_addr(), "Broker ready");

    while manager.status().is_running() {
        thread::sleep(stats_interval);
        match manager.get_stats(true).await_result(stats_interval) {
            Ok(stats) => info!(%stats, "Engine statistics"),
            Err(e) if manager.status().is_terminated() => {
                error!(error = %e, status = %manager.status(), "Engine stopped");
            },
            Err(e) => error!(error = %e, "Failed to collect statistics"),
        }
    }

    server.stop();
    manager.join();
    if let EngineStatus::Failed { message } = manager.status() {
        return Err(message.into());
    }
    Ok(())
}
