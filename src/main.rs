use std::{error::Error, path::PathBuf, process, sync::Arc};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::mpsc;
use veil::Redact;

use tether::{
    config::Config,
    error::Error as TetherError,
    events::{Event, EventClient, State},
    protocol::{key, Envelope, Kind, Request},
    session::Session,
    signal,
    window::{QueryFactory, Record, SlidingWindow, WindowListener},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Default, PartialEq, Eq, Parser, Redact)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// Settings given on the command line take precedence.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Server host name or address
    #[arg(long, value_hint = ValueHint::Hostname)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Connect with TLS (`wss`)
    #[arg(long, default_value_t = false)]
    secure: bool,

    /// Server password
    #[arg(long, env = "TETHER_PASSWORD", hide_env_values = true)]
    #[redact]
    password: Option<String>,

    /// Page through the results of a query
    ///
    /// For example `query_play_queue_tracks`.
    #[arg(short, long, value_name = "NAME")]
    watch: Option<String>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Merges the configuration file with the command line.
fn load_config(args: &Args) -> Result<Config, TetherError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.secure {
        config.secure = true;
    }
    if let Some(password) = &args.password {
        config.password.clone_from(password);
    }

    if !config.has_valid_connection() {
        return Err(TetherError::invalid_argument("no server host and port configured"));
    }

    debug!("{config:?}");
    Ok(config)
}

/// Counts and pages through the results of one request.
struct Watched {
    request: Request,
}

impl QueryFactory for Watched {
    fn count_query(&self) -> Option<Envelope> {
        Envelope::request(self.request)
            .option(key::COUNT_ONLY, true)
            .build()
            .ok()
    }

    fn page_query(&self, offset: usize, limit: usize) -> Option<Envelope> {
        Envelope::request(self.request)
            .option(key::OFFSET, offset)
            .option(key::LIMIT, limit)
            .build()
            .ok()
    }
}

/// What the watched window reports to the main loop.
enum Progress {
    Reloaded(usize),
    Loaded { offset: usize, count: usize },
}

struct Forwarder(mpsc::UnboundedSender<Progress>);

impl WindowListener for Forwarder {
    fn on_metadata_loaded(&self, offset: usize, count: usize) {
        if count > 0 {
            let _ = self.0.send(Progress::Loaded { offset, count });
        }
    }

    fn on_reloaded(&self, count: usize) {
        let _ = self.0.send(Progress::Reloaded(count));
    }
}

fn describe(record: &Record) -> String {
    ["title", "album", "artist", "value"]
        .into_iter()
        .find_map(|field| record.get(field).and_then(serde_json::Value::as_str))
        .map_or_else(
            || serde_json::Value::Object(record.clone()).to_string(),
            ToOwned::to_owned,
        )
}

/// Main application loop.
///
/// # Errors
///
/// Returns an error when the configuration is invalid or the server rejects
/// the password.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;
    let session = Session::new(&config)?;
    let mut signals = signal::Handler::new()?;

    let (client, mut events) = EventClient::new();
    session.add_client(client.id(), client.clone());

    let (progress_tx, mut progress) = mpsc::unbounded_channel();
    let window = match &args.watch {
        Some(name) => {
            let request = name.parse::<Request>()?;
            let window = SlidingWindow::new(session.clone(), Arc::new(Watched { request }), describe);
            window.set_listener(Arc::new(Forwarder(progress_tx)));
            window.resume();
            Some(window)
        }
        None => None,
    };

    // Records are printed once, although pages overlap.
    let mut printed = 0;

    let result = loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("received {signal}, shutting down gracefully");
                    break Ok(());
                }

                info!("received {signal}, reconnecting");
                session.disconnect();
                session.reconnect();
            }

            Some(event) = events.recv() => match event {
                Event::StateChanged { new, old } => {
                    if new == State::Connected {
                        match session.server_version() {
                            Some(version) => info!("connected to {} (api version {version})", config.host),
                            None => info!("connected to {}", config.host),
                        }
                        if session.should_upgrade() {
                            warn!("{} runs an outdated server, please upgrade it", config.host);
                        }
                    } else if old == State::Connected {
                        warn!("lost connection to {}", config.host);
                    }
                }
                Event::Message(message) if message.kind() == Kind::Broadcast => {
                    info!("{}: {}", message.name(), serde_json::Value::Object(message.options().clone()));
                }
                Event::Message(message) => debug!("unsolicited {}", message.name()),
                Event::InvalidPassword => {
                    break Err(TetherError::unauthenticated("server rejected the password").into());
                }
            },

            Some(update) = progress.recv() => {
                let Some(window) = &window else { continue };
                match update {
                    Progress::Reloaded(count) => {
                        info!("{count} results");
                        printed = 0;
                        if count > 0 {
                            let _ = window.get_track(0);
                        }
                    }
                    Progress::Loaded { offset, count } => {
                        let end = offset + count;
                        for index in printed.max(offset)..end {
                            if let Some(record) = window.get_track(index) {
                                println!("{index:>6}  {record}");
                            }
                        }
                        printed = printed.max(end);

                        if printed < window.count() {
                            let _ = window.get_track(printed);
                        }
                    }
                }
            }
        }
    };

    if let Some(window) = window {
        window.pause();
    }
    session.remove_client(client.id());
    session.shutdown();

    result
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
