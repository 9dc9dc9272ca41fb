//! msgctl - query, drive and watch MSG servers from the command line

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use msg_client::{Callback, Client, ClientConfig};
use msg_sim::{spawn_tcp_server_on, VirtualServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "msgctl", version, about = "Talk to SAO MSG servers")]
struct Cli {
    /// Server host (overrides the configuration file)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port (overrides the configuration file)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Client configuration file (default: ~/.config/msgctl/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(short, long, global = true)]
    timeout: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the server name, published parameters and registered commands
    Lst,
    /// Read one or more published parameters
    Get {
        #[arg(required = true)]
        params: Vec<String>,
    },
    /// Run a registered command
    Run {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Subscribe to parameters and print every update until interrupted
    Watch {
        #[arg(required = true)]
        params: Vec<String>,
    },
    /// Serve a virtual MSG server until interrupted
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:6868")]
        bind: String,
        /// Virtual server definition (JSON)
        #[arg(long)]
        server_config: Option<PathBuf>,
    },
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load_from(path)?,
            None => ClientConfig::load(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.timeout {
            if !(secs.is_finite() && secs > 0.0) {
                bail!("timeout must be a positive number of seconds");
            }
            config.default_timeout_ms = Some((secs * 1000.0) as u64);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "msgctl=info,msg_client=info,msg_protocol=info,msg_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Serve {
            bind,
            server_config,
        } => serve(bind, server_config.as_deref()).await,
        command => {
            let client = Client::new(cli.client_config()?);
            client
                .open()
                .await
                .with_context(|| format!("opening {}", client.config().addr()))?;

            let result = run_command(&client, command).await;
            client.close().await;
            result
        }
    }
}

async fn run_command(client: &Client, command: &Command) -> Result<()> {
    match command {
        Command::Lst => {
            let caps = client.capabilities();
            println!("server {}", caps.name);
            for param in &caps.published {
                println!("published {}", param);
            }
            for command in &caps.registered {
                println!("registered {}", command);
            }
        }
        Command::Get { params } => {
            for param in params {
                let value = client.get_joined(param).await?;
                println!("{} {}", param, value);
            }
        }
        Command::Run { command, args } => {
            let reply = client.run(command, args).await?;
            if !reply.is_empty() {
                println!("{}", reply.join(" "));
            }
        }
        Command::Watch { params } => {
            for param in params {
                let name = param.clone();
                let callback = Callback::sync(move |value| println!("{} {}", name, value.join(" ")));
                client.subscribe(param, Some(callback)).await?;
            }
            tracing::info!("Watching {}; press Ctrl-C to stop", params.join(", "));

            tokio::select! {
                result = tokio::signal::ctrl_c() => result.context("waiting for Ctrl-C")?,
                _ = client.wait_closed() => bail!("server closed the connection"),
            }
            for param in params {
                client.unsubscribe(param).await?;
            }
        }
        Command::Serve { .. } => bail!("serve does not connect to a server"),
    }
    Ok(())
}

async fn serve(bind: &str, server_config: Option<&Path>) -> Result<()> {
    let config = match server_config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<VirtualServerConfig>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => VirtualServerConfig::default(),
    };

    let handle = spawn_tcp_server_on(bind, config)
        .await
        .with_context(|| format!("binding {}", bind))?;
    tracing::info!("Serving virtual MSG server on {}; press Ctrl-C to stop", handle.addr());

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    handle.shutdown();
    Ok(())
}
