use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, web};
use clap::Parser;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};
use url::Url;

mod api;
mod client;
mod config;
mod db;
mod logging;
mod processes;
mod proxy;
mod shutdown;
mod worker;

use crate::api::{execution_config, job::JobService, validation};
use crate::client::{ClientError, JobClient};
use crate::config::{EdgeConfig, ExecutionConfig, GatewayConfig, HopConfig, KeySource};
use crate::db::JobStore;
use crate::processes::ProcessRegistry;
use crate::proxy::keys::KeyRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::worker::{JobWorker, ProcessRunner, job_worker::recover_interrupted, retention::run_retention};

#[derive(Parser, Debug)]
#[command(name = "geo-job-gateway")]
#[command(version)]
#[command(about = "Asynchronous geoprocessing job gateway")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the execution service (job store, workers, job API)
    Serve,

    /// Run the bridge proxy in front of the execution service
    Bridge,

    /// Run the authenticating gateway in front of the bridge
    Gateway,

    /// Run the public TLS edge terminator in front of the gateway
    Edge,

    /// Submit a job and print its id
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        /// Process to execute
        #[arg(long, default_value = "execute")]
        process: String,

        /// Model identifier
        #[arg(long)]
        model: String,

        /// Model arguments as a JSON object
        #[arg(long, default_value = "{}", value_parser = parse_json)]
        args: serde_json::Value,

        /// Wait for the job to finish and print its results
        #[arg(long)]
        wait: bool,
    },

    /// Print the status document of a job
    Status {
        #[command(flatten)]
        client: ClientArgs,

        job_id: String,
    },

    /// Print the results of a job
    Results {
        #[command(flatten)]
        client: ClientArgs,

        job_id: String,

        /// Poll until the job is finished instead of failing while it runs
        #[arg(long)]
        wait: bool,
    },
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Public base URL of the job API
    #[arg(long, env = "GATEWAY_URL", default_value = "https://127.0.0.1:8443/")]
    url: Url,

    /// API key sent as the `key` query parameter
    #[arg(long, env = "API_KEY")]
    key: Option<String>,

    /// Seconds between status polls
    #[arg(long, default_value = "2")]
    poll_interval: u64,

    /// Give up waiting after this many seconds
    #[arg(long)]
    deadline: Option<u64>,
}

impl ClientArgs {
    fn build(self) -> Result<(JobClient, Duration, Option<Duration>), ClientError> {
        let client = JobClient::new(self.url, self.key, Duration::from_secs(60))?;
        Ok((
            client,
            Duration::from_secs(self.poll_interval.max(1)),
            self.deadline.map(Duration::from_secs),
        ))
    }
}

fn parse_json(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("not valid JSON: {}", e))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let args = Args::parse();
    let env = config::environment();

    match args.command {
        Commands::Serve => {
            let config = ExecutionConfig::from_lookup(&env).map_err(io::Error::other)?;
            logging::init(&config.server.log_dir)?;
            serve(config).await
        }
        Commands::Bridge => {
            let config = HopConfig::from_lookup(&env, config::BRIDGE_PORT).map_err(io::Error::other)?;
            logging::init(&config.server.log_dir)?;
            info!("Starting bridge proxy");
            run_hop(proxy::bridge::run(&config)?).await
        }
        Commands::Gateway => {
            let config = GatewayConfig::from_lookup(&env).map_err(io::Error::other)?;
            logging::init(&config.hop.server.log_dir)?;
            info!("Starting authenticating gateway");
            run_hop(gateway(config)?).await
        }
        Commands::Edge => {
            let config = EdgeConfig::from_lookup(&env).map_err(io::Error::other)?;
            logging::init(&config.hop.server.log_dir)?;
            info!("Starting edge terminator");
            run_hop(proxy::edge::run(&config)?).await
        }
        command => {
            logging::init_console();
            run_client(command).await.map_err(io::Error::other)
        }
    }
}

/// Start the execution service and block until it has shut down
async fn serve(config: ExecutionConfig) -> io::Result<()> {
    let store = match &config.database_url {
        Some(url) => JobStore::postgres(url, config.max_db_connections)
            .await
            .map_err(io::Error::other)?,
        None => JobStore::memory(),
    };

    info!("Starting execution service");
    info!("Configuration loaded successfully:");
    info!("  - Job store: {}", store.backend());
    info!("  - Max payload size: {} bytes", config.server.max_payload_size);
    info!("  - Max concurrent jobs: {}", config.max_concurrent_jobs);
    info!("  - Number of workers: {}", config.num_workers);
    info!("  - Public base URL: {}", config.public_base_url);
    info!("  - Workspace root: {}", config.workspace_root.display());

    let processes = Arc::new(ProcessRegistry::new(
        config.execute_command.clone(),
        config.validate_command.clone(),
    ));
    let runner = Arc::new(ProcessRunner::new(
        config.workspace_root.clone(),
        config.results_base_url.clone(),
        config.job_timeout,
    ));

    let recovered = recover_interrupted(&store, &runner).await.map_err(io::Error::other)?;
    if recovered > 0 {
        info!("Marked {} interrupted jobs as failed", recovered);
    }

    let wake = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Spawn background workers with semaphore-based bounded concurrency
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let job_worker = JobWorker::new(
        store.clone(),
        processes.clone(),
        runner,
        wake.clone(),
        config.poll_interval,
    );
    let mut background = Vec::new();
    for worker_id in 1..=config.num_workers {
        let job_worker = job_worker.clone();
        let worker_semaphore = semaphore.clone();
        let worker_shutdown_rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            job_worker.run(worker_id, worker_semaphore, worker_shutdown_rx).await;
        }));
        info!("Spawned worker {}", worker_id);
    }

    if let Some(retention) = config.job_retention {
        background.push(tokio::spawn(run_retention(
            store.clone(),
            retention,
            config.retention_interval,
            shutdown_rx.clone(),
        )));
    }

    let job_service = web::Data::new(
        JobService::new(
            store.clone(),
            processes,
            config.public_base_url.clone(),
            config.server.ack_window,
            wake,
        )
        .with_allowed_models(config.allowed_models.clone()),
    );
    let server_store = web::Data::new(store.clone());
    let max_payload_size = config.server.max_payload_size;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(server_store.clone())
            .app_data(job_service.clone())
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .app_data(validation::json_config(max_payload_size))
            .configure(execution_config)
    })
    .bind(&config.server.bind_addr)?
    .run();

    info!("Server starting on http://{}", config.server.bind_addr);

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    ShutdownCoordinator::new(server_handle, server_task)
        .with_background(background, shutdown_tx, store)
        .wait_for_shutdown()
        .await
}

fn gateway(config: GatewayConfig) -> io::Result<actix_web::dev::Server> {
    let keys = match &config.keys {
        KeySource::File(path) => KeyRegistry::from_file(path),
        KeySource::Inline(document) => KeyRegistry::from_json(document),
    }
    .map_err(io::Error::other)?;
    if keys.is_empty() {
        warn!("No API keys configured, every request will be rejected");
    } else {
        info!("Loaded {} API keys", keys.len());
    }

    proxy::gateway::run(&config, keys)
}

async fn run_hop(server: actix_web::dev::Server) -> io::Result<()> {
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);
    ShutdownCoordinator::new(server_handle, server_task)
        .wait_for_shutdown()
        .await
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to render response: {}", e),
    }
}

async fn run_client(command: Commands) -> Result<(), ClientError> {
    match command {
        Commands::Submit {
            client,
            process,
            model,
            args,
            wait,
        } => {
            let (job_client, poll_interval, deadline) = client.build()?;
            let job = job_client
                .submit(&process, &serde_json::json!({"model": model, "args": args}))
                .await?;
            println!("{}", job.job_id);
            if wait {
                let results = job_client.wait_for_results(&job, poll_interval, deadline).await?;
                print_json(&results);
            }
        }
        Commands::Status { client, job_id } => {
            let (job_client, _, _) = client.build()?;
            let status = job_client.status(&job_client.job(&job_id)?).await?;
            print_json(&status);
        }
        Commands::Results {
            client,
            job_id,
            wait,
        } => {
            let (job_client, poll_interval, deadline) = client.build()?;
            let job = job_client.job(&job_id)?;
            let results = if wait {
                job_client.wait_for_results(&job, poll_interval, deadline).await?
            } else {
                job_client.results(&job).await?
            };
            print_json(&results);
        }
        Commands::Serve | Commands::Bridge | Commands::Gateway | Commands::Edge => {}
    }
    Ok(())
}
