use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use textroute::broker::{Engine, SharedEngine};
use textroute::config::{Settings, load_config};
use textroute::persistence::Persistence;
use textroute::registry::Registry;
use textroute::remote::{start_broker_server, start_redelivery_loop};
use textroute::router::{ROUTER_TIMEOUT, Router};
use textroute::transport::{Daemon, MessageTransport, Purpose};
use textroute::utils::error::{DaemonError, WorkerError};
use textroute::utils::logging;
use textroute::worker::Worker;
use textroute::worker::signal::stop_on_signal;

#[derive(Parser, Debug)]
#[command(name = "textroute", version, about = "Short text message router")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the router and keep the transports running.
    Router {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run the WebSocket broker server.
    Broker {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Manage one transport daemon.
    Transport {
        /// start, stop, restart or run
        action: String,
        name: String,
        /// send_messages or receive_messages
        purpose: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Simulate the reception of a message and print the reply.
    FakeSms {
        #[arg(short = 'n', long, default_value = "+555555")]
        number: String,
        #[arg(short, long, default_value = "default")]
        transport: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(required = true)]
        text: Vec<String>,
    },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("textroute: {e}");
            ExitCode::FAILURE
        }
    }
}

fn settings(config: Option<&Path>) -> Result<Settings, WorkerError> {
    let settings = load_config(config)?;
    logging::init(&settings.log_level);
    Ok(settings)
}

fn run(command: Command) -> Result<(), WorkerError> {
    match command {
        Command::Router { config } => {
            let settings = settings(config.as_deref())?;
            let mut router = Router::new(&settings, &Registry::with_builtins())?;
            stop_on_signal(router.core().running_flag()).map_err(DaemonError::from)?;
            router.start(ROUTER_TIMEOUT, None, None)?;
            Ok(())
        }
        Command::Broker { config } => {
            let settings = settings(config.as_deref())?;
            run_broker(&settings)
        }
        Command::Transport {
            action,
            name,
            purpose,
            config,
        } => {
            let settings = settings(config.as_deref())?;
            let purpose: Purpose = purpose.parse()?;
            manage_transport(&settings, &action, &name, purpose)
        }
        Command::FakeSms {
            number,
            transport,
            config,
            text,
        } => {
            let settings = settings(config.as_deref())?;
            let mut transport = MessageTransport::from_settings(
                &transport,
                Purpose::SendMessages,
                &settings,
                &Registry::with_builtins(),
            )?;
            transport.fake_sms_reception(&number, &text.join(" "))?;
            Ok(())
        }
    }
}

fn manage_transport(
    settings: &Settings,
    action: &str,
    name: &str,
    purpose: Purpose,
) -> Result<(), WorkerError> {
    settings.transport(name)?;

    match action {
        "run" => {
            let mut transport = MessageTransport::from_settings(
                name,
                purpose,
                settings,
                &Registry::with_builtins(),
            )?;
            stop_on_signal(transport.core().running_flag()).map_err(DaemonError::from)?;
            transport.run()
        }
        "start" => {
            if !Daemon::new(settings, name, purpose)?.start()? {
                info!("Transport {name}/{purpose} is already running");
            }
            Ok(())
        }
        "stop" => {
            Daemon::new(settings, name, purpose)?.stop()?;
            Ok(())
        }
        "restart" => {
            Daemon::new(settings, name, purpose)?.restart()?;
            Ok(())
        }
        other => Err(DaemonError::UnknownAction(other.to_string()).into()),
    }
}

fn run_broker(settings: &Settings) -> Result<(), WorkerError> {
    let server = &settings.broker_server;
    let addr = server.addr();
    let persistence = Persistence::open(&server.data_dir)?;
    let engine = SharedEngine::new(Engine::new_with_persistence(persistence.clone()));

    let runtime = tokio::runtime::Runtime::new().map_err(DaemonError::from)?;
    runtime.block_on(async {
        if server.ack_timeout_secs > 0 {
            tokio::spawn(start_redelivery_loop(
                engine.clone(),
                Duration::from_secs(server.ack_timeout_secs),
                server.max_redeliveries,
            ));
        }

        tokio::select! {
            served = start_broker_server(&addr, engine) => served?,
            _ = tokio::signal::ctrl_c() => info!("Interrupt received, stopping the broker"),
        }
        Ok::<(), WorkerError>(())
    })?;

    persistence.flush()?;
    info!("Broker storage flushed to {}", server.data_dir.display());
    Ok(())
}
