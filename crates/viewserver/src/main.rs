use std::cell::RefCell;
use std::fs::OpenOptions;
use std::rc::Rc;
use std::sync::Mutex;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use viewserver::{LineStream, ProtocolVersion, QueryServer, ServerConfig, SharedIo};

/// CouchDB-compatible view server speaking newline-delimited JSON over stdio.
#[derive(Debug, Parser)]
#[command(name = "viewserver", version, about)]
struct Cli {
    /// Protocol version of the database host (e.g. 0.11.1). Defaults to the
    /// newest dialect.
    #[arg(long = "couchdb-version", value_name = "X.Y.Z")]
    couchdb_version: Option<ProtocolVersion>,

    /// Write engine logs to PATH, or `-` for stderr. Without this flag the
    /// engine logs nothing; stdout always stays reserved for the protocol.
    #[arg(long = "log-file", value_name = "PATH")]
    log_file: Option<String>,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,

    /// Permit GET requests to update functions.
    #[arg(long = "allow-get-update")]
    allow_get_update: bool,
}

fn init_logging(cli: &Cli) {
    let Some(target) = cli.log_file.as_deref() else {
        return;
    };
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if target == "-" {
        builder.with_writer(std::io::stderr).init();
    } else {
        match OpenOptions::new().create(true).append(true).open(target) {
            Ok(file) => builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init(),
            Err(err) => eprintln!("cannot open log file `{target}`: {err}"),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    let version = cli.couchdb_version.clone().unwrap_or_default();
    info!(%version, "view server started");

    let io: SharedIo = Rc::new(RefCell::new(LineStream::new(
        std::io::stdin().lock(),
        std::io::stdout(),
    )));
    let mut server = QueryServer::new(version, io).with_config(ServerConfig {
        allow_get_update: cli.allow_get_update,
    });
    std::process::exit(server.serve());
}
