//! OrbitPresence command line client
//!
//! Publishes to, listens on and inspects topics of a shared presence store.
//! Useful to watch room traffic or poke a node while debugging a cluster.

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info};

use orbitpresence::{Callback, Config, Presence, config::REDIS_URL_ENV};

#[derive(Parser, Debug)]
#[command(name = "orbitpresence")]
#[command(about = "Inspect and drive a shared presence store")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Redis URL (overrides PRESENCE_REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a JSON payload to a topic (no payload sends `false`)
    Publish {
        topic: String,
        /// JSON payload, e.g. '{"event":"join"}'
        payload: Option<String>,
    },
    /// Print every message received on the given topics until Ctrl-C
    Listen {
        #[arg(required = true)]
        topics: Vec<String>,
    },
    /// Print whether any node is subscribed to a topic
    Exists { topic: String },
}

/// An explicit URL wins; the environment is only read without one
fn load_config(redis_url: Option<&str>) -> anyhow::Result<Config> {
    let config = match redis_url {
        Some(url) => Config::default().with_redis_url(url)?,
        None => Config::from_env()?,
    };
    Ok(config)
}

async fn listen(presence: &Presence, topics: &[String]) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    for topic in topics {
        let tx = tx.clone();
        let name = topic.clone();
        presence
            .subscribe(
                topic,
                Callback::new(move |message| {
                    let _ = tx.send((name.clone(), message.clone()));
                }),
            )
            .await?;
        info!(topic = %topic, "Listening");
    }
    drop(tx);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some((topic, message)) => {
                    println!("{}", serde_json::json!({ "topic": topic, "message": message }));
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.redis_url.as_deref())?;
    let presence = Presence::connect(&config).await?;

    let result: anyhow::Result<()> = match &args.command {
        Command::Publish { topic, payload } => match payload {
            Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(payload) => presence.publish(topic, Some(&payload)).await.map_err(Into::into),
                Err(e) => Err(anyhow::anyhow!("payload is not valid JSON: {e}")),
            },
            None => presence.publish_empty(topic).await.map_err(Into::into),
        },
        Command::Listen { topics } => listen(&presence, topics).await,
        Command::Exists { topic } => match presence.exists(topic).await {
            Ok(exists) => {
                println!("{exists}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    };

    presence.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // JSON logs on stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .with_writer(std::io::stderr)
        .init();

    info!("OrbitPresence v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!(error = %e, "Command failed");
        error!("Check {} or --redis-url", REDIS_URL_ENV);
        std::process::exit(1);
    }

    Ok(())
}
