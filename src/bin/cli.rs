//! Murmur CLI
//!
//! Send and receive signed messages over the libp2p overlay or Tor onion
//! services, and manage the background daemon.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use murmur::contacts::{normalize_address, ContactBook};
use murmur::daemon::hooks::{SAMPLE_HOOK, ON_RECEIVE};
use murmur::daemon::{DaemonError, DaemonStatus, InboxHandler, PidFile, Profile, StatusPage, StopOutcome};
use murmur::discovery::PeerRouting;
use murmur::identity::validate_address;
use murmur::message::{LogFilter, MessageLog};
use murmur::supervisor::Supervisor;
use murmur::transport::onion::{check_tor_available, check_tor_socks, OnionTransport};
use murmur::transport::overlay::OverlayTransport;
use murmur::{Config, Error, LocalIdentity, Node, SendOptions, SendOutcome, Transport, TransportMode};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace period for `daemon stop` before SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Murmur: serverless messaging with self-certifying addresses
#[derive(Parser)]
#[command(name = "murmur")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory (default: ~/.murmur)
    #[arg(long, env = "MURMUR_DIR", global = true)]
    dir: Option<PathBuf>,

    /// Transport: overlay (libp2p) or onion (tor)
    #[arg(long, env = "MURMUR_MODE", global = true, default_value = "onion")]
    mode: TransportMode,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Tor SOCKS5 proxy address
    #[arg(long, global = true)]
    tor_socks: Option<SocketAddr>,

    /// Tor control port address
    #[arg(long, global = true)]
    tor_control: Option<SocketAddr>,

    /// Tor control port password
    #[arg(long, env = "MURMUR_TOR_PASSWORD", global = true, hide_env_values = true)]
    tor_password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the identity for the selected mode and the hooks directory
    Init,

    /// Print your address(es)
    Id,

    /// Send a message to a contact or address
    Send {
        /// Contact alias or address
        target: String,

        /// Message text (joined with spaces)
        message: Vec<String>,

        /// Read the message body from stdin
        #[arg(long)]
        stdin: bool,

        /// Message type
        #[arg(long = "type", default_value = "message")]
        kind: String,

        /// Id of the message this replies to
        #[arg(long)]
        reply_to: Option<String>,

        /// Thread to continue
        #[arg(long)]
        thread: Option<String>,

        /// Metadata as key=value (repeatable)
        #[arg(long, value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },

    /// Check whether a peer is online
    Ping {
        /// Contact alias or address
        target: String,
    },

    /// Listen in the foreground, printing each message as a JSON line
    Listen,

    /// Show received messages
    Inbox {
        /// Only messages from this alias or address
        #[arg(long)]
        from: Option<String>,

        /// Only messages in this thread
        #[arg(long)]
        thread: Option<String>,

        /// Only the most recent N
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show or clear queued messages
    Outbox {
        #[command(subcommand)]
        action: Option<OutboxAction>,
    },

    /// Manage contact aliases
    Contacts {
        #[command(subcommand)]
        action: Option<ContactsAction>,
    },

    /// List peers in the DHT routing table (overlay mode)
    Peers,

    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum OutboxAction {
    /// Drop every queued message
    Clear,
}

#[derive(Subcommand)]
enum ContactsAction {
    /// List contacts
    List,
    /// Save an alias
    Add {
        /// Alias
        alias: String,
        /// Peer id or onion address
        address: String,
    },
    /// Forget an alias
    #[command(alias = "rm")]
    Remove {
        /// Alias
        alias: String,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Run the supervised listener in the foreground
    Run,
    /// Start the daemon in the background
    Start,
    /// Show whether the daemon is running
    Status,
    /// Stop the daemon
    Stop,
    /// Show the daemon log
    Log {
        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_config(cli: &Cli) -> murmur::Result<Config> {
    let dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => Config::default_data_dir()
            .ok_or_else(|| Error::Config("could not find a home directory; pass --dir".into()))?,
    };

    let mut config = Config::new(dir).with_mode(cli.mode).with_verbose(cli.verbose);
    if let Some(socks) = cli.tor_socks {
        config.tor.socks_addr = socks;
    }
    if let Some(control) = cli.tor_control {
        config.tor.control_addr = control;
    }
    config.tor.control_password = cli.tor_password.clone();
    Ok(config)
}

async fn run(command: Commands, config: Config) -> murmur::Result<()> {
    match command {
        Commands::Init => cmd_init(&config),
        Commands::Id => cmd_id(&config),
        Commands::Send {
            target,
            message,
            stdin,
            kind,
            reply_to,
            thread,
            meta,
        } => {
            let body = read_body(message, stdin)?;
            let options = SendOptions {
                kind,
                reply_to,
                thread,
                meta,
            };
            cmd_send(&config, &target, &body, options).await
        }
        Commands::Ping { target } => cmd_ping(&config, &target).await,
        Commands::Listen => cmd_listen(&config, InboxHandler::for_foreground(&config)).await,
        Commands::Inbox { from, thread, limit } => cmd_inbox(&config, from, thread, limit).await,
        Commands::Outbox { action } => cmd_outbox(&config, action).await,
        Commands::Contacts { action } => cmd_contacts(&config, action),
        Commands::Peers => cmd_peers(&config).await,
        Commands::Daemon { action } => match action {
            DaemonAction::Run => cmd_daemon_run(&config).await,
            DaemonAction::Start => cmd_daemon_start(&config).await,
            DaemonAction::Status => cmd_daemon_status(&config),
            DaemonAction::Stop => cmd_daemon_stop(&config).await,
            DaemonAction::Log { lines } => {
                print_tail(&config.log_path(), lines, "");
                Ok(())
            }
        },
    }
}

fn parse_meta(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

fn read_body(words: Vec<String>, stdin: bool) -> murmur::Result<String> {
    if stdin {
        let mut body = String::new();
        io::stdin()
            .read_to_string(&mut body)
            .map_err(|e| Error::Config(format!("read stdin: {e}")))?;
        return Ok(body.trim_end_matches(['\n', '\r']).to_string());
    }
    if words.is_empty() {
        return Err(Error::Config("provide a message or use --stdin".into()));
    }
    Ok(words.join(" "))
}

/// First 16 characters of an address, for human-facing output
fn short(address: &str) -> &str {
    address.get(..16).unwrap_or(address)
}

fn load_contacts(config: &Config) -> murmur::Result<ContactBook> {
    Ok(ContactBook::load(config.contacts_path())?)
}

fn resolve_target(config: &Config, target: &str) -> murmur::Result<String> {
    let contacts = load_contacts(config)?;
    Ok(normalize_address(contacts.resolve(target)).to_string())
}

async fn open_transport(
    config: &Config,
    identity: &LocalIdentity,
    listening: bool,
) -> murmur::Result<Arc<dyn Transport>> {
    match identity {
        LocalIdentity::Onion(onion) => {
            let check = if listening {
                check_tor_available(&config.tor).await
            } else {
                check_tor_socks(&config.tor).await
            };
            check.map_err(|e| {
                Error::Config(format!(
                    "{e}\nIs tor running? Start it with ControlPort {} and SocksPort {}, or pass --tor-socks/--tor-control",
                    config.tor.control_addr.port(),
                    config.tor.socks_addr.port()
                ))
            })?;
            Ok(Arc::new(OnionTransport::new(onion.clone(), config.tor.clone())))
        }
        LocalIdentity::Overlay(keypair) => {
            let transport = OverlayTransport::start(keypair.clone(), &config.overlay)?;
            if !listening {
                let peers = transport.wait_for_bootstrap(config.overlay.bootstrap_wait).await;
                info!(peers, "overlay bootstrapped");
            }
            Ok(Arc::new(transport))
        }
    }
}

fn cmd_init(config: &Config) -> murmur::Result<()> {
    let identity = LocalIdentity::load_or_create(config)?;

    let hooks = config.hooks_dir();
    std::fs::create_dir_all(&hooks).map_err(|e| Error::Config(format!("create {}: {e}", hooks.display())))?;
    let sample = hooks.join(format!("{ON_RECEIVE}.sample"));
    if !sample.exists() {
        if let Err(e) = std::fs::write(&sample, SAMPLE_HOOK) {
            warn!(error = %e, "could not write sample hook");
        }
    }

    match &identity {
        LocalIdentity::Onion(_) => {
            println!("Identity: {}.onion", identity.address());
            println!("Key:      {}", config.onion_key_path().display());
        }
        LocalIdentity::Overlay(_) => {
            println!("Identity: {}", identity.address());
            println!("Key:      {}", config.overlay_key_path().display());
        }
    }
    println!("Hooks:    {}/", hooks.display());
    Ok(())
}

fn cmd_id(config: &Config) -> murmur::Result<()> {
    let mut found = false;
    for mode in [TransportMode::Overlay, TransportMode::Onion] {
        let scoped = config.clone().with_mode(mode);
        match LocalIdentity::load(&scoped) {
            Ok(identity) => {
                found = true;
                println!("{:<8} {}", mode.as_str(), identity.address());
            }
            Err(murmur::error::IdentityError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    if !found {
        // reports the selected mode's missing key
        LocalIdentity::load(config)?;
    }
    Ok(())
}

async fn cmd_send(config: &Config, target: &str, body: &str, options: SendOptions) -> murmur::Result<()> {
    let to = resolve_target(config, target)?;
    let identity = Arc::new(LocalIdentity::load_or_create(config)?);
    if let Err(e) = validate_address(config.mode, &to) {
        return Err(Error::Config(format!(
            "cannot resolve '{target}' to a {} address ({e}); add it with: murmur contacts add {target} <address>",
            config.mode
        )));
    }

    let transport = open_transport(config, &identity, false).await?;
    let node = Node::from_config(config, transport, identity);
    eprintln!("Connecting to {}...", short(&to));

    match node.send(&to, body, options).await? {
        SendOutcome::Delivered { envelope, .. } => {
            eprintln!("Delivered to {}", short(&to));
            println!("{}", envelope.id);
        }
        SendOutcome::Unconfirmed { envelope, reason } => {
            eprintln!("Sent to {}, no ack ({reason}); it was likely delivered", short(&to));
            println!("{}", envelope.id);
        }
        SendOutcome::Queued { entry, reason } => {
            eprintln!("Could not reach {} ({reason})", short(&to));
            let pidfile = PidFile::new(config.pid_path());
            if matches!(pidfile.status(), Ok(DaemonStatus::Running(_))) {
                eprintln!("Queued in outbox; the daemon will retry delivery");
            } else {
                eprintln!("Queued in outbox; start the daemon to retry automatically");
            }
            println!("{}", entry.envelope.id);
        }
    }
    Ok(())
}

async fn cmd_ping(config: &Config, target: &str) -> murmur::Result<()> {
    let to = resolve_target(config, target)?;
    let identity = Arc::new(LocalIdentity::load_or_create(config)?);
    let transport = open_transport(config, &identity, false).await?;
    let node = Node::from_config(config, transport, identity);

    eprintln!("Connecting to {}...", short(&to));
    let rtt = node.ping(&to).await?;
    println!("pong from {}: rtt={}ms", short(&to), rtt.as_millis());
    Ok(())
}

async fn cmd_listen(config: &Config, handler: InboxHandler) -> murmur::Result<()> {
    let identity = Arc::new(LocalIdentity::load_or_create(config)?);
    let transport = open_transport(config, &identity, true).await?;
    let address = identity.address();
    let node = Arc::new(Node::from_config(config, transport, identity));

    let page = StatusPage::new(Profile::load(&config.profile_path()), address.clone());
    let supervisor = Supervisor::new(node, Arc::new(handler)).with_status_page(page);

    match config.mode {
        TransportMode::Onion => {
            eprintln!("Listening as {address}.onion:{}", config.tor.message_port);
            eprintln!("Status page: http://{address}.onion");
        }
        TransportMode::Overlay => eprintln!("Listening as {address}"),
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));
    supervisor.run(shutdown).await;
    eprintln!("Shutting down");
    Ok(())
}

async fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "cannot watch SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    info!("shutdown requested");
    token.cancel();
}

async fn cmd_inbox(
    config: &Config,
    from: Option<String>,
    thread: Option<String>,
    limit: Option<usize>,
) -> murmur::Result<()> {
    let from = match from {
        Some(from) => Some(resolve_target(config, &from)?),
        None => None,
    };
    let envelopes = MessageLog::new(config.inbox_path()).read_all().await?;
    let filter = LogFilter {
        from,
        thread,
        last: limit,
    };
    let selected = filter.apply(envelopes);
    if selected.is_empty() {
        eprintln!("No messages.");
    }
    for envelope in selected {
        print_json_line(&envelope);
    }
    Ok(())
}

async fn cmd_outbox(config: &Config, action: Option<OutboxAction>) -> murmur::Result<()> {
    let outbox = murmur::Outbox::new(config.outbox_path());
    match action {
        Some(OutboxAction::Clear) => {
            let count = outbox.clear().await?;
            eprintln!("Cleared {count} queued message(s)");
        }
        None => {
            let entries = outbox.entries().await?;
            if entries.is_empty() {
                eprintln!("Outbox is empty.");
            }
            for entry in entries {
                print_json_line(&entry);
            }
        }
    }
    Ok(())
}

fn print_json_line<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "could not encode record"),
    }
}

fn cmd_contacts(config: &Config, action: Option<ContactsAction>) -> murmur::Result<()> {
    let mut contacts = load_contacts(config)?;
    match action.unwrap_or(ContactsAction::List) {
        ContactsAction::List => {
            if contacts.is_empty() {
                println!("No contacts saved.");
            }
            for (alias, address) in contacts.iter() {
                println!("{alias:<20} {address}");
            }
        }
        ContactsAction::Add { alias, address } => {
            let address = normalize_address(&address).to_string();
            validate_address(TransportMode::Onion, &address)
                .or_else(|_| validate_address(TransportMode::Overlay, &address))
                .map_err(|e| Error::Config(format!("invalid address '{address}': {e}")))?;
            contacts.insert(alias.clone(), address.clone());
            contacts.save()?;
            println!("Added contact '{alias}' -> {}...", short(&address));
        }
        ContactsAction::Remove { alias } => {
            if contacts.remove(&alias).is_none() {
                return Err(Error::Config(format!("contact '{alias}' not found")));
            }
            contacts.save()?;
            println!("Removed contact '{alias}'");
        }
    }
    Ok(())
}

async fn cmd_peers(config: &Config) -> murmur::Result<()> {
    if config.mode != TransportMode::Overlay {
        return Err(Error::Config("peers needs --mode overlay".into()));
    }
    let identity = LocalIdentity::load_or_create(config)?;
    let LocalIdentity::Overlay(keypair) = identity else {
        return Err(Error::Config("overlay identity expected".into()));
    };

    let transport = OverlayTransport::start(keypair, &config.overlay)?;
    transport.wait_for_bootstrap(config.overlay.bootstrap_wait).await;
    let peers = transport.discovery().routing().routing_table().await;
    if peers.is_empty() {
        println!("No peers in the routing table.");
    }
    for peer in peers {
        println!("{}  ({} addresses)", peer.peer, peer.addrs.len());
    }
    Ok(())
}

async fn cmd_daemon_run(config: &Config) -> murmur::Result<()> {
    let pidfile = PidFile::new(config.pid_path());
    if let DaemonStatus::Running(pid) = pidfile.status()? {
        if pid != std::process::id() as i32 {
            return Err(DaemonError::AlreadyRunning(pid).into());
        }
    }
    pidfile.write(std::process::id())?;

    let result = cmd_listen(config, InboxHandler::for_daemon(config)).await;
    if let Err(e) = pidfile.remove() {
        warn!(error = %e, "could not remove pid file");
    }
    result
}

async fn cmd_daemon_start(config: &Config) -> murmur::Result<()> {
    use std::os::unix::process::CommandExt;

    let pidfile = PidFile::new(config.pid_path());
    if let DaemonStatus::Running(pid) = pidfile.status()? {
        return Err(DaemonError::AlreadyRunning(pid).into());
    }
    // fail here rather than in the background
    LocalIdentity::load(config)?;

    let log_path = config.log_path();
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| Error::Config(format!("open {}: {e}", log_path.display())))?;
    let log_err = log
        .try_clone()
        .map_err(|e| Error::Config(format!("open {}: {e}", log_path.display())))?;
    let exe = std::env::current_exe().map_err(|e| Error::Config(format!("locate executable: {e}")))?;

    let mut command = std::process::Command::new(exe);
    command
        .arg("--dir")
        .arg(config.data_dir())
        .args(["--mode", config.mode.as_str()])
        .arg("--tor-socks")
        .arg(config.tor.socks_addr.to_string())
        .arg("--tor-control")
        .arg(config.tor.control_addr.to_string())
        .args(["daemon", "run"])
        .stdin(std::process::Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .process_group(0);
    if config.verbose {
        command.arg("--verbose");
    }
    let mut child = command
        .spawn()
        .map_err(|e| Error::Config(format!("start daemon: {e}")))?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    if let Ok(Some(_)) = child.try_wait() {
        return Err(DaemonError::ExitedEarly(log_path).into());
    }

    println!("Daemon started (PID {})", child.id());
    println!("Log: {}", log_path.display());
    Ok(())
}

fn cmd_daemon_status(config: &Config) -> murmur::Result<()> {
    match PidFile::new(config.pid_path()).status()? {
        DaemonStatus::Running(pid) => println!("Daemon: running (PID {pid})"),
        DaemonStatus::Stopped => println!("Daemon: stopped"),
    }
    let log_path = config.log_path();
    if log_path.exists() {
        println!("\nRecent log:");
        print_tail(&log_path, 5, "  ");
    }
    Ok(())
}

async fn cmd_daemon_stop(config: &Config) -> murmur::Result<()> {
    match PidFile::new(config.pid_path()).stop(STOP_GRACE).await? {
        StopOutcome::NotRunning => println!("Daemon is not running."),
        StopOutcome::Stopped(pid) => println!("Daemon stopped (PID {pid})"),
        StopOutcome::Killed(pid) => println!("Daemon killed (PID {pid})"),
    }
    Ok(())
}

fn print_tail(path: &Path, lines: usize, indent: &str) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        println!("No log entries.");
        return;
    };
    let all: Vec<&str> = contents.lines().collect();
    for line in &all[all.len().saturating_sub(lines)..] {
        println!("{indent}{line}");
    }
}
