//! Main quern-server application entry point.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use log::info;
use structopt::StructOpt;

use quern::config::Config;
use quern::deadletter::DeadLetterRouter;
use quern::handlers;
use quern::models::ApplicationState;
use quern::producer::Producer;
use quern::registry::QueueRegistry;
use quern::scheduler::Scheduler;
use quern::store::RedisStore;
use quern::sweeps;

/// Command line interface options.
#[derive(StructOpt)]
#[structopt(name = "quern-server", about = "Redis backed job queue server")]
struct CliOpts {
    /// Path to configuration file
    #[structopt(parse(from_os_str))]
    config: Option<PathBuf>,
}

fn parse_config_from_cli_args(opts: &CliOpts) -> Config {
    match &opts.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Failed to parse config file {}: {}", path.display(), err);
                process::exit(1);
            }
        },
        None => Config::default(),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = parse_config_from_cli_args(&CliOpts::from_args());

    env_logger::Builder::new()
        .parse_filters(&config.server.log_level)
        .init();

    let max_body_size = config.server.max_body_size_bytes().unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let pool = deadpool_redis::Config::from_url(config.redis_url())
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .unwrap_or_else(|err| {
            eprintln!("Failed to create Redis connection pool: {}", err);
            process::exit(1);
        });
    info!("Using Redis at {}", config.redis_url());

    let store = Arc::new(RedisStore::new(pool, &config.redis.key_namespace));
    let registry = match QueueRegistry::new(store, config.queues()).await {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            eprintln!("Failed to register queues: {}", err);
            process::exit(1);
        }
    };
    let producer = Producer::new(Arc::clone(&registry));
    let dead_letter = DeadLetterRouter::new(Arc::clone(&registry));

    sweeps::start_sweeps(
        Arc::clone(&registry),
        dead_letter.clone(),
        config.server.stall_check_interval,
        config.server.retention_check_interval,
    );

    match config.schedule_entries() {
        Ok(entries) => {
            if !entries.is_empty() {
                Scheduler::new(producer.clone(), entries).spawn();
            }
        }
        Err(err) => {
            eprintln!("Invalid schedule configuration: {}", err);
            process::exit(1);
        }
    }

    if config.server.read_only {
        info!("Running in read-only mode, mutating endpoints are disabled");
    }

    let server_config = config.clone();
    let http_server = HttpServer::new(move || {
        let state = ApplicationState {
            registry: Arc::clone(&registry),
            producer: producer.clone(),
            dead_letter: dead_letter.clone(),
            config: server_config.clone(),
        };
        let mut app = App::new().app_data(web::Data::new(state));
        if let Some(limit) = max_body_size {
            app = app.app_data(web::JsonConfig::default().limit(limit));
        }
        app.route("/health", web::get().to(handlers::health::index))
            .route("/info", web::get().to(handlers::info::index))
            .route("/queue", web::get().to(handlers::queue::index))
            .route("/queue/{name}", web::get().to(handlers::queue::summary))
            .route("/queue/{name}/jobs", web::get().to(handlers::queue::job_ids))
            .route("/queue/{name}/events", web::get().to(handlers::queue::events))
            .route("/queue/{name}/job", web::post().to(handlers::queue::enqueue))
            .route("/job/{id}", web::get().to(handlers::job::index))
            .route("/job/{id}/status", web::get().to(handlers::job::status))
            .route("/deadletter", web::get().to(handlers::deadletter::index))
            .route(
                "/deadletter/{id}/replay",
                web::post().to(handlers::deadletter::replay),
            )
    });

    let mut http_server = http_server.bind(config.server_addr())?;
    if let Some(threads) = config.server.threads {
        http_server = http_server.workers(threads);
    }
    if let Some(timeout) = config.server.shutdown_timeout {
        http_server = http_server.shutdown_timeout(timeout);
    }

    info!("Starting queue server at: {}", config.server_addr());
    http_server.run().await
}
