//! Binary entry point for the corral CLI.

use std::env;
use std::io::{self, Write};
use std::process;

use clap::{Args, Parser, Subcommand};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use corral::connectivity::{Connectivity, ConnectivityOptions};
use corral::credentials::{CredentialKey, CredentialStore, CredentialStoreError};
use corral::machine::store::{MachineStore, MachineStoreError};
use corral::machine::{Machine, OLLAMA_DEFAULT_PORT};
use corral::provider::{
    CreateMachineRequest, CredentialArgs, ProviderError, ProviderKind,
};
use corral::provisioner::{ProvisionError, Provisioner};
use corral::settings::{Settings, Storage};
use corral::ssh::SshRemoteRunner;
use corral::tunnel::{Tunnel, TunnelError};

#[derive(Debug, Parser)]
#[command(
    name = "corral",
    about = "Provision and manage cloud machines running Ollama",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new machine on a cloud provider.
    Create(CreateCommand),
    /// Delete a machine, its key pair, and its local record.
    #[command(alias = "rm")]
    Delete(MachineNameArg),
    /// Start a stopped machine.
    Start(MachineNameArg),
    /// Stop a running machine.
    Stop(MachineNameArg),
    /// List all machines.
    Ls,
    /// Print a shell command exporting OLLAMA_HOST for a machine.
    Env(MachineNameArg),
    /// Forward a local port to a private machine's Ollama service.
    Tunnel(TunnelCommand),
    /// Manage cloud provider credentials.
    #[command(subcommand)]
    Credentials(CredentialsCommand),
}

#[derive(Debug, Args)]
struct MachineNameArg {
    /// Name of the machine.
    name: String,
}

#[derive(Debug, Args)]
struct CreateCommand {
    /// Name of the machine to create.
    name: String,
    /// Cloud provider to use.
    #[arg(long, short = 'p')]
    provider: String,
    /// Stored credentials to authenticate with.
    #[arg(long, short = 'c')]
    credentials: String,
    /// Instance type (or flavor, depending on the provider).
    #[arg(long, short = 't', default_value = "")]
    instance_type: String,
    /// Boot image label.
    #[arg(long, short = 'i', default_value = "")]
    image: String,
    /// Provider region.
    #[arg(long, short = 'r', default_value = "")]
    region: String,
    /// Availability zone inside the region.
    #[arg(long, short = 'z', default_value = "")]
    zone: String,
    /// Tags to attach, as key=value pairs.
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    tags: Vec<String>,
    /// Expose Ollama publicly instead of keeping it loopback-only
    /// (not recommended; prefer the tunnel or Tailscale).
    #[arg(long)]
    public: bool,
    /// Tailscale auth key; joins the machine to your tailnet.
    #[arg(long)]
    tailscale_auth_key: Option<String>,
}

#[derive(Debug, Args)]
struct TunnelCommand {
    /// Name of the machine to tunnel to.
    name: String,
    /// Local port to listen on.
    #[arg(long, default_value_t = OLLAMA_DEFAULT_PORT)]
    local_port: u16,
    /// Remote Ollama port to forward to.
    #[arg(long, default_value_t = OLLAMA_DEFAULT_PORT)]
    remote_port: u16,
}

#[derive(Debug, Subcommand)]
enum CredentialsCommand {
    /// Store new provider credentials.
    Create(CredentialsCreateCommand),
    /// List stored credentials.
    #[command(alias = "ls")]
    List,
    /// Remove stored credentials.
    #[command(alias = "rm")]
    Remove(CredentialsRemoveCommand),
}

#[derive(Debug, Args)]
struct CredentialsCreateCommand {
    /// Name for the stored credentials.
    name: String,
    /// Provider the credentials belong to.
    #[arg(long, short = 'p')]
    provider: String,
    #[command(flatten)]
    values: CredentialArgs,
}

#[derive(Debug, Args)]
struct CredentialsRemoveCommand {
    /// Name of the stored credentials.
    name: String,
    /// Provider the credentials belong to.
    #[arg(long, short = 'p')]
    provider: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Store(#[from] MachineStoreError),
    #[error(transparent)]
    Credentials(#[from] CredentialStoreError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("invalid tag {0}: expected key=value")]
    InvalidTag(String),
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        report_error(&err);
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Create(command) => create_machine(command).await,
        Command::Delete(args) => {
            let storage = open_storage()?;
            provisioner_for_machine(&args.name, &storage)?
                .delete_machine(&args.name)
                .await?;
            Ok(())
        }
        Command::Start(args) => {
            let storage = open_storage()?;
            provisioner_for_machine(&args.name, &storage)?
                .start_machine(&args.name)
                .await?;
            Ok(())
        }
        Command::Stop(args) => {
            let storage = open_storage()?;
            provisioner_for_machine(&args.name, &storage)?
                .stop_machine(&args.name)
                .await?;
            Ok(())
        }
        Command::Ls => list_machines(),
        Command::Env(args) => print_env(&args.name),
        Command::Tunnel(command) => run_tunnel(command),
        Command::Credentials(command) => manage_credentials(command),
    }
}

async fn create_machine(command: CreateCommand) -> Result<(), CliError> {
    let storage = open_storage()?;
    let provider = ProviderKind::from_name(&command.provider)?;

    let mut builder = CreateMachineRequest::builder()
        .name(&command.name)
        .instance_type(&command.instance_type)
        .image(&command.image)
        .region(&command.region)
        .zone(&command.zone);
    for tag in &command.tags {
        let (key, value) = tag
            .split_once('=')
            .ok_or_else(|| CliError::InvalidTag(tag.clone()))?;
        builder = builder.tag(key, value);
    }
    let request = builder.build()?;

    let connectivity = Connectivity::from_options(&ConnectivityOptions {
        public: command.public,
        tailscale_auth_key: command.tailscale_auth_key.clone(),
    });

    let provisioner = provisioner_for(provider, &command.credentials, &command.region, &storage)?;
    provisioner.create_machine(request, &connectivity).await?;
    Ok(())
}

fn list_machines() -> Result<(), CliError> {
    let storage = open_storage()?;
    let store = MachineStore::open(&storage.machine_dir())?;
    let machines = store.list()?;

    let rows: Vec<MachineRow> = machines.iter().map(MachineRow::from).collect();
    let table = Table::new(rows).with(Style::blank()).to_string();
    writeln!(io::stdout(), "{table}").ok();
    Ok(())
}

#[derive(Tabled)]
struct MachineRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "PROVIDER")]
    provider: String,
    #[tabled(rename = "REGION")]
    region: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "OLLAMA HOST")]
    ollama_host: String,
    #[tabled(rename = "OLLAMA PORT")]
    ollama_port: String,
}

impl From<&Machine> for MachineRow {
    fn from(machine: &Machine) -> Self {
        Self {
            name: machine.instance.name.clone(),
            state: machine.instance.state.to_string(),
            provider: machine.provider_name.clone(),
            region: machine.instance.region.clone(),
            ip: machine.instance.ip.clone().unwrap_or_default(),
            ollama_host: machine.ollama.host.clone(),
            ollama_port: machine.ollama.port.to_string(),
        }
    }
}

fn print_env(name: &str) -> Result<(), CliError> {
    let storage = open_storage()?;
    let store = MachineStore::open(&storage.machine_dir())?;
    let machine = store.get_by_name(name)?;

    writeln!(io::stdout(), "{}", env_command(&machine)).ok();
    Ok(())
}

fn env_command(machine: &Machine) -> String {
    let address = machine.ollama.address();
    match shell_flavour().as_deref() {
        Some("fish") => format!("set -gx OLLAMA_HOST \"{address}\";"),
        Some("tcsh" | "csh") => format!("setenv OLLAMA_HOST \"{address}\";"),
        Some("powershell") => format!("$Env:OLLAMA_HOST = \"{address}\""),
        _ => format!("export OLLAMA_HOST=\"{address}\""),
    }
}

fn shell_flavour() -> Option<String> {
    if cfg!(windows) {
        return Some(String::from("powershell"));
    }
    let shell = env::var("SHELL").ok()?;
    let name = shell.rsplit('/').next()?.to_owned();
    Some(name)
}

fn run_tunnel(command: TunnelCommand) -> Result<(), CliError> {
    let storage = open_storage()?;
    let store = MachineStore::open(&storage.machine_dir())?;
    let machine = store.get_by_name(&command.name)?;

    let tunnel = Tunnel::new(machine)?
        .with_local_port(command.local_port)
        .with_remote_port(command.remote_port);
    tunnel.serve()?;
    Ok(())
}

fn manage_credentials(command: CredentialsCommand) -> Result<(), CliError> {
    let store = CredentialStore::with_keyring();
    match command {
        CredentialsCommand::Create(args) => {
            let provider = ProviderKind::from_name(&args.provider)?;
            let mut credentials = provider.credentials(&args.values);
            credentials.complete()?;
            credentials.validate()?;

            let key = CredentialKey {
                name: args.name.clone(),
                provider: provider.name().to_owned(),
            };
            store.save(&key, &credentials.to_json()?)?;
            tracing::info!(name = %args.name, provider = %provider.name(), "credentials saved");
            Ok(())
        }
        CredentialsCommand::List => {
            let rows: Vec<CredentialRow> = store
                .list()?
                .into_iter()
                .map(|key| CredentialRow {
                    name: key.name,
                    provider: key.provider,
                })
                .collect();
            let table = Table::new(rows).with(Style::blank()).to_string();
            writeln!(io::stdout(), "{table}").ok();
            Ok(())
        }
        CredentialsCommand::Remove(args) => {
            let provider = ProviderKind::from_name(&args.provider)?;
            store.delete(&CredentialKey {
                name: args.name.clone(),
                provider: provider.name().to_owned(),
            })?;
            tracing::info!(name = %args.name, "credentials removed");
            Ok(())
        }
    }
}

#[derive(Tabled)]
struct CredentialRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PROVIDER")]
    provider: String,
}

fn open_storage() -> Result<Storage, CliError> {
    let settings =
        Settings::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let storage =
        Storage::from_settings(&settings).map_err(|err| CliError::Config(err.to_string()))?;
    storage
        .init()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(storage)
}

fn provisioner_for(
    provider: ProviderKind,
    credentials_name: &str,
    region: &str,
    storage: &Storage,
) -> Result<Provisioner<SshRemoteRunner>, CliError> {
    let store = MachineStore::open(&storage.machine_dir())?;
    let credential_store = CredentialStore::with_keyring();
    let manager = provider.machine_manager(&credential_store, credentials_name, region)?;
    Ok(Provisioner::new(
        provider.name(),
        credentials_name,
        manager,
        store,
        storage.key_dir(),
        SshRemoteRunner,
    ))
}

fn provisioner_for_machine(
    name: &str,
    storage: &Storage,
) -> Result<Provisioner<SshRemoteRunner>, CliError> {
    let store = MachineStore::open(&storage.machine_dir())?;
    let machine = store.get_by_name(name)?;

    let provider = ProviderKind::from_name(&machine.provider_name)?;
    let credential_store = CredentialStore::with_keyring();
    let manager = provider.machine_manager(
        &credential_store,
        &machine.credentials_name,
        &machine.instance.region,
    )?;
    Ok(Provisioner::new(
        provider.name(),
        machine.credentials_name.clone(),
        manager,
        store,
        storage.key_dir(),
        SshRemoteRunner,
    ))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
