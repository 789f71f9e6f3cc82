mod beanstalk;
mod config;
mod intake;
mod logging;
mod processing;
mod server;
mod shutdown;
mod storage;
#[cfg(test)]
mod testing;
mod throttle;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use beanstalk::{ClientPool, ClientSettings, QueueClient};
use config::AppConfig;
use intake::{ConnectionRegistry, IntakeHandler};
use logging::{LogLevel, Logger, LoggerConfig};
use processing::WorkerPool;
use serde_json::json;
use server::TcpServer;
use shutdown::ShutdownHooks;
use storage::StorageFacade;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

fn main() {
    print_startup_banner();

    let (config_path, app_config) = load_config_or_exit();
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(1);
        });

    let logger = Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    });
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        "Configuration loaded",
        Some(json!({ "path": config_path.display().to_string() })),
    );

    let storage = Arc::new(
        StorageFacade::initialize(&app_config, &logger).unwrap_or_else(|error| {
            eprintln!("storage initialization error: {error}");
            process::exit(1);
        }),
    );

    let client_settings = app_config.queue.client_settings();
    verify_broker_or_exit(&client_settings, &logger);

    let mut workers = WorkerPool::start(
        app_config.queue.processors,
        &client_settings,
        storage.clone(),
        &logger,
        app_config.queue.worker_options(),
    )
    .unwrap_or_else(|error| {
        eprintln!("worker pool startup error: {error}");
        process::exit(1);
    });

    let producer = Arc::new(ClientPool::new(
        client_settings.clone(),
        app_config.queue.pool_max_idle,
    ));
    let handler = Arc::new(IntakeHandler::new(
        storage.clone(),
        producer,
        app_config.intake_policy(),
        logger.clone(),
    ));
    let registry = Arc::new(ConnectionRegistry::new());

    let mut server = TcpServer::from_app_config(
        &app_config,
        handler,
        Arc::clone(&registry),
        logger.clone(),
    )
    .unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(1);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(1);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} accepting reports",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "io_threads": server.io_thread_count(),
            "workers": workers.len(),
            "tube": app_config.queue.tube,
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(1);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    while !shutdown_hooks.is_triggered() {
        match server.try_accept() {
            Ok(Some(_)) => {}
            Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(error) => {
                logger.log(
                    LogLevel::Warn,
                    Some("main::server"),
                    "Accept failed",
                    Some(json!({ "error": error.to_string() })),
                );
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    server.shutdown();
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Intake server stopped",
        Some(json!({ "open_connections": registry.count() })),
    );

    let detached = workers.stop(WORKER_DRAIN_TIMEOUT);
    if let Err(error) = storage.flush() {
        logger.log(
            LogLevel::Error,
            Some("main::shutdown"),
            "Storage flush failed",
            Some(json!({ "error": error.to_string() })),
        );
    }
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Shutdown completed",
        Some(json!({ "detached_workers": detached })),
    );
}

fn load_config_or_exit() -> (std::path::PathBuf, AppConfig) {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(loaded) => loaded,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(1);
        }
    }
}

fn verify_broker_or_exit(settings: &ClientSettings, logger: &Logger) {
    let mut client = QueueClient::new(settings.clone());
    let tube = settings
        .tube
        .clone()
        .unwrap_or_else(|| beanstalk::DEFAULT_TUBE.to_owned());
    match client.stats_tube(&tube) {
        Ok(stats) => logger.log(
            LogLevel::Info,
            Some("main::queue"),
            "Queue broker reachable",
            Some(json!({
                "address": format!("{}:{}", settings.host, settings.port),
                "tube": tube,
                "stats_bytes": stats.len(),
            })),
        ),
        // The tube is created by the first put; NOT_FOUND still proves the broker answers.
        Err(error) if !error.is_disconnect() => logger.log(
            LogLevel::Info,
            Some("main::queue"),
            "Queue broker reachable, tube not created yet",
            Some(json!({
                "address": format!("{}:{}", settings.host, settings.port),
                "tube": tube,
                "response": error.to_string(),
            })),
        ),
        Err(error) => {
            eprintln!(
                "queue broker at {}:{} is not usable: {error}",
                settings.host, settings.port
            );
            process::exit(1);
        }
    }
    client.close();
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
     _        _   _ _                                   _
 ___| |_ __ _| |_(_) | __      _ __ ___ _ __   ___  _ __| |_
/ __| __/ _` | __| | |/ /_____| '__/ _ \ '_ \ / _ \| '__| __|
\__ \ || (_| | |_| |   <_____| | |  __/ |_) | (_) | |  | |_
|___/\__\__,_|\__|_|_|\_\    |_|  \___| .__/ \___/|_|   \__|
                                      |_|"#;
    const APP_DESCRIPTION: &str =
        "Telemetry report intake with per-entity throttling and queued persistence.";

    println!("{BANNER_COLOR}{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("STATIK_REPORT_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}Stop with SIGINT or SIGTERM.{RESET}");
    println!();
}
