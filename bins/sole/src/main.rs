use anyhow::{Context, bail};
use clap::Parser;
use sole_config::SoleConfig;
use sole_engine::{InstanceEvent, SingleInstance};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sole")]
#[command(about = "Runs one primary instance per application; later instances forward their arguments to it")]
struct Args {
    /// TOML configuration file (defaults to app name "sole")
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Message forwarded to the primary when another instance is running
    message: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SoleConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SoleConfig::for_app("sole"),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut instance = SingleInstance::start(&config).context("starting single instance")?;

    if instance.is_secondary() {
        let message = args.message.join(" ");
        info!(
            instance_id = instance.instance_id(),
            primary_pid = instance.primary_pid(),
            "another instance is running, forwarding arguments"
        );
        if !instance.send_message(message.as_bytes(), config.timeout()) {
            bail!("primary (pid {}) did not accept the message", instance.primary_pid());
        }
        return Ok(());
    }

    println!("primary {} listening in {}", instance.identifier(), instance.runtime_dir().display());
    for event in instance.events().iter() {
        match event {
            InstanceEvent::Started => println!("instance started"),
            InstanceEvent::Message { instance_id, payload } => {
                println!("#{instance_id}: {}", String::from_utf8_lossy(&payload));
            }
        }
    }
    Ok(())
}
