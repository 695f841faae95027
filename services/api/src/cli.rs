use crate::{maintenance, server};
use catechesis::error::AppError;
use catechesis::stores::StoreKind;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "catechesis-api",
    about = "Run and maintain the catechism enrollment service",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Copy one store, or all three, into a backup directory
    Backup(BackupArgs),
    /// Replace one store file with a backup copy; stop the service first
    Restore(RestoreArgs),
    /// Run every expiry sweep once and print the report
    Sweep,
    /// Print the schema version of each store
    Schema,
    /// Create the first administrator profile
    BootstrapAdmin(BootstrapArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

#[derive(Args, Debug)]
pub(crate) struct BackupArgs {
    /// Store to copy (enrollment, access_pages, registry); all three when omitted
    #[arg(long)]
    pub(crate) store: Option<StoreKind>,
    /// Directory receiving the timestamped copies
    #[arg(long, default_value = "./backups")]
    pub(crate) dir: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct RestoreArgs {
    /// Store to replace
    #[arg(long)]
    pub(crate) store: StoreKind,
    /// Backup file produced by the backup command
    #[arg(long)]
    pub(crate) from: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct BootstrapArgs {
    /// Display name of the administrator
    #[arg(long)]
    pub(crate) name: String,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Backup(args) => maintenance::backup(args).await,
        Command::Restore(args) => maintenance::restore(args).await,
        Command::Sweep => maintenance::sweep().await,
        Command::Schema => maintenance::schema().await,
        Command::BootstrapAdmin(args) => maintenance::bootstrap_admin(args).await,
    }
}
