use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    config::DEFAULT_CONFIG_FILE, load_settings, load_snapshot, save_snapshot, Controller,
    ControllerOptions, HttpGateway, InFlightPolicy, Notifier, UploadFile,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod view;

use commands::{Command, ParseError};

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the project builder")]
struct Args {
    /// TOML settings file; missing files fall back to defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    request_timeout_secs: Option<u64>,
    #[arg(long)]
    in_flight_policy: Option<InFlightPolicy>,
    /// Where the session is saved on exit and restored on launch.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(base_url) = args.base_url {
        settings.base_url = base_url;
    }
    if let Some(secs) = args.request_timeout_secs {
        settings.request_timeout_secs = secs;
    }
    if let Some(policy) = args.in_flight_policy {
        settings.in_flight_policy = policy;
    }
    if let Some(path) = args.snapshot {
        settings.snapshot_path = Some(path);
    }
    info!(base_url = %settings.base_url, policy = ?settings.in_flight_policy, "terminal: starting");

    let gateway = Arc::new(HttpGateway::from_settings(&settings)?);
    let controller = Controller::with_options(
        gateway,
        Notifier::new(),
        ControllerOptions::from(&settings),
    );
    let subscription = controller.subscribe(|next, prev| {
        let (before, after) = (view::render(prev), view::render(next));
        for line in view::changed_lines(&before, &after) {
            println!("{line}");
        }
    });

    let restored = match &settings.snapshot_path {
        Some(path) => load_snapshot(path)?,
        None => None,
    };
    match restored {
        Some(session) => controller.restore(session).await,
        None => {
            for line in view::render(&controller.snapshot().await) {
                println!("{line}");
            }
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match commands::parse_line(&line) {
            Ok(Command::Quit) => break,
            Ok(Command::Help) => println!("{}", commands::USAGE),
            Ok(command) => {
                if let Err(err) = run(&controller, command).await {
                    eprintln!("error: {err:#}");
                }
            }
            Err(ParseError::Empty) => {}
            Err(err) => eprintln!("{err}"),
        }
    }

    controller.detach();
    subscription.unsubscribe();
    if let Some(path) = &settings.snapshot_path {
        if let Err(err) = save_snapshot(path, &controller.snapshot().await) {
            warn!(error = %err, "terminal: could not save session snapshot");
        }
    }
    Ok(())
}

async fn run(controller: &Controller, command: Command) -> Result<()> {
    match command {
        Command::Start(config) => controller.start(config).await?,
        Command::Upload(path) => {
            let file = UploadFile::from_path(&path).await?;
            controller.upload_file(file).await?;
        }
        Command::Confirm => controller.confirm().await?,
        Command::Decline => controller.decline().await?,
        Command::Refresh => controller.refresh().await?,
        Command::Add { record, fields } => controller.add_record(record, fields).await?,
        Command::Edit { index, fields } => controller.update_record(index, fields).await?,
        Command::Remove { index } => controller.remove_record(index).await?,
        Command::Save => controller.save_changes().await?,
        Command::Info => {
            let info = controller.session_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::End => controller.end_session().await?,
        Command::Reset => controller.reset().await?,
        Command::Message(text) => controller.send_message(text).await?,
        Command::Help | Command::Quit => {}
    }
    Ok(())
}
