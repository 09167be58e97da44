#![doc = include_str!("../README.md")]

use std::{
    fs,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::{
    Parser, Subcommand
};
use env_logger::Env;
use log::{
    info, warn
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::timeout,
};

use data_processor::{
    broker::{
        Broker, MemoryBroker, RedisBroker
    },
    config::Config,
    intake,
    server,
    tensor,
    worker::{
        self,
        Worker,
    },
};

// how long a shutdown waits for the job in progress
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

// CLI
#[derive(Parser, Debug)]
#[command(name = "data-processor")]
#[command(version = "1.0")]
#[command(about = "Preprocessing stage of the inference pipeline: turns queued \
                   image jobs into tensors and hands them to the inference stage.",
          long_about = None)
]
struct Cli {
    /// TOML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Overrides `redis_url`; `memory://` runs without Redis
    #[arg(long)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP surface and run the stage worker
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// Serve HTTP only
        #[arg(long, action)]
        no_worker: bool,
    },

    /// Run the stage worker only
    Worker,

    /// Queue a job description read from a JSON file
    Submit {
        #[arg(short, long)]
        job_file: String,
    },

    /// Print the record of a job
    Status {
        #[arg(short, long)]
        job_id: String,
    },
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis_url {
        config.redis_url = url;
    }
    let command = cli.command.unwrap_or(Commands::Serve {
        port: None,
        no_worker: false,
    });
    if let Commands::Serve { port: Some(port), .. } = &command {
        config.http.port = *port;
    }
    let config = Arc::new(config);
    info!("<-> {} <->", config.service_name);

    let broker = open_broker(&config).await?;

    match command {
        Commands::Serve { no_worker, .. } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let stage = if no_worker {
                Vec::new()
            } else {
                spawn_stage(broker.clone(), config.clone(), shutdown_rx)?
            };
            // blocks until the server is told to stop
            server::startup(server::AppState {
                broker: broker,
                config: config.clone(),
            })
            .await
            .context("HTTP server failed")?;
            stop_stage(shutdown_tx, stage).await;
        },

        Commands::Worker => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let stage = spawn_stage(broker, config, shutdown_rx)?;
            tokio::signal::ctrl_c().await?;
            stop_stage(shutdown_tx, stage).await;
        },

        Commands::Submit { job_file } => {
            if config.uses_memory_broker() {
                warn!("The in-process broker does not outlive this command.");
            }
            let raw = fs::read_to_string(&job_file)
                .with_context(|| format!("Failed to read job file `{job_file}`"))?;
            let job_id = intake::submit_raw(broker.as_ref(), &config, &raw, "cli").await?;
            println!("{job_id}");
        },

        Commands::Status { job_id } => {
            match intake::status(broker.as_ref(), &config, &job_id).await? {
                Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
                None => anyhow::bail!("No record for job `{job_id}`"),
            }
        },
    }
    Ok(())
}

async fn open_broker(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    if config.uses_memory_broker() {
        warn!("Using the in-process broker, jobs are not shared with other processes.");
        return Ok(Arc::new(MemoryBroker::new()));
    }
    let broker = RedisBroker::connect(&config.redis_url)
        .await
        .with_context(|| format!("Cannot reach Redis at `{}`", config.redis_url))?;
    Ok(Arc::new(broker))
}

// worker loop plus liveness heartbeat
fn spawn_stage(
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let fetcher = tensor::ImageFetcher::new(&config.fetch)
        .context("Failed to build the image fetcher")?;
    let worker = Worker::new(broker.clone(), fetcher, config.clone());
    let worker_shutdown = shutdown.clone();
    Ok(vec![
        tokio::spawn(async move {
            worker.run(worker_shutdown).await
        }),
        tokio::spawn(worker::heartbeat(broker, config, shutdown)),
    ])
}

async fn stop_stage(
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
) {
    if tasks.is_empty() {
        return;
    }
    info!("Shutting down the stage worker.");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        match timeout(SHUTDOWN_GRACE, task).await {
            Ok(Err(e)) => warn!("Stage task ended abnormally: `{e}`"),
            Err(_) => warn!("Stage task did not stop within {SHUTDOWN_GRACE:?}"),
            Ok(Ok(())) => {},
        }
    }
}
