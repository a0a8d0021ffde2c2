//! serimodem CLI - send and receive files over stdio
//!
//! The process's stdin/stdout act as the serial line, so the binary
//! composes with pipes, ptys, and socket wrappers the same way
//! `sz`/`rz` do. Progress and logs go to stderr.

use clap::{ArgAction, Parser, Subcommand};
use serimodem::cli::{exit_code_for, resolve_flavor, ExitCodes};
use serimodem::{DiskStore, SessionEvent, StdioChannel, Transfer, TransferConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;

/// Serial file transfer over stdio
#[derive(Parser, Debug)]
#[command(
    name = "serimodem",
    version,
    about = "XMODEM / YMODEM / ZMODEM file transfer",
    long_about = None
)]
struct Cli {
    /// Use XMODEM
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    xmodem: bool,

    /// Use YMODEM
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    ymodem: bool,

    /// Use ZMODEM
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    zmodem: bool,

    /// 1024-byte blocks (XMODEM)
    #[arg(long = "1k", global = true, action = ArgAction::SetTrue)]
    one_k: bool,

    /// CRC-16 integrity (XMODEM)
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    crc: bool,

    /// Streaming mode without per-block ACKs
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    g: bool,

    /// Plainest variant of the chosen protocol
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    vanilla: bool,

    /// Per-block / per-header timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send files to the remote side
    Send {
        /// Files to transmit
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Receive files from the remote side
    Receive {
        /// Directory the files land in
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Local name for an XMODEM download (XMODEM sends none)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version are not usage errors.
            if err.use_stderr() {
                eprintln!("{err}");
                return ExitCode::from(ExitCodes::USAGE);
            }
            let _ = err.print();
            return ExitCode::from(ExitCodes::SUCCESS);
        }
    };

    let flavor = match resolve_flavor(
        cli.xmodem, cli.ymodem, cli.zmodem, cli.one_k, cli.crc, cli.g, cli.vanilla,
    ) {
        Ok(flavor) => flavor,
        Err(msg) => {
            eprintln!("serimodem: {msg}");
            return ExitCode::from(ExitCodes::USAGE);
        }
    };

    let mut config = TransferConfig::for_flavor(flavor);
    if let Some(secs) = cli.timeout {
        config.timeout = Duration::from_secs(secs);
    }

    let transfer = match &cli.command {
        Commands::Send { files } => Transfer::upload(flavor, files.clone(), config),
        Commands::Receive { dir, output } => match output {
            Some(name) => Transfer::download_named(flavor, dir.clone(), name, config),
            None => Transfer::download(flavor, dir.clone(), config),
        },
    };
    let transfer = match transfer {
        Ok(transfer) => transfer,
        Err(err) => {
            eprintln!("serimodem: {err}");
            return ExitCode::from(ExitCodes::USAGE);
        }
    };

    let session = transfer.session();

    // Ctrl-C requests a clean protocol abort, keeping any partial file.
    {
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                session.cancel_transfer(true);
            }
        });
    }

    // Mirror session events onto stderr for the operator.
    {
        let mut events = session.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let SessionEvent::Message(message) = event {
                    eprintln!("serimodem: {}", message.text);
                }
            }
        });
    }

    let mut wire = StdioChannel::new();
    let state = transfer.run(&mut wire, &DiskStore::new()).await;
    info!(?state, rate = session.transfer_rate(), "transfer finished");

    exit_code_for(&session)
}
