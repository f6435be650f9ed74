//! The predstore-client executable supports the following command line arguments:
//!
//! `predstore-client get <COLLECTION> [--addr IP-PORT]`
//!
//!     Print a whole collection (users, guesses or results) as JSON.
//!
//! `predstore-client put <COLLECTION> <JSON> [--addr IP-PORT]`
//!
//!     Shallow-merge a JSON object into a collection.
//!
//! `predstore-client backup|export|clear-all|restart|stats|winners|snapshots|health [--addr IP-PORT]`
//!
//!     Run a maintenance operation or print a report.
//!
//! `predstore-client restore <SNAPSHOT> [--addr IP-PORT]`
//!
//!     Replace every collection with the content of a snapshot.
//!
//! --addr accepts an IP address, either v4 or v6, and a port number, with the format IP:PORT.
//! If --addr is not specified then connect on 127.0.0.1:4000.
//! Print an error and return a non-zero exit code on server error, on a rate limited request,
//! or if IP-PORT does not parse as an address.
//!
//! `predstore-client -V`
//!
//!     Print the version.

use std::net::SocketAddr;
use std::process::exit;

use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use predstore::{CollectionName, PredictionClient, Request, Result, StoreError};
use serde_json::Value;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_ADDRESS: &str = "127.0.0.1:4000";

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    /// the server's ip:port
    addr: SocketAddr,
    req: Request,
}

impl Opt {
    /// validates the `addr` parameter is a valid IP address and PORT
    /// returns `Ok<Opt>` if everything is valid
    /// # Errors
    /// returns [`StoreError::Parsing`] if one of the parameters is invalid
    fn build(addr: &str, req: Request) -> Result<Opt> {
        let addr: SocketAddr = addr.parse().map_err(|_| {
            StoreError::Parsing(format!("could not parse {} into an IP addess and port", &addr))
        })?;

        Ok(Opt { addr, req })
    }
}

fn main() {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let addr_arg = Arg::with_name("addr")
        .long("addr")
        .value_name("IP_ADDR:PORT")
        .help("sets the IP_ADDR:PORT of the server to connect to")
        .default_value(DEFAULT_ADDRESS);
    let collection_arg = Arg::with_name("COLLECTION")
        .required(true)
        .index(1)
        .possible_values(&["users", "guesses", "results"]);

    let simple = |name: &'static str, about: &'static str| {
        SubCommand::with_name(name).about(about).arg(addr_arg.clone())
    };

    let matches = App::new("predstore-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("talks to a predstore-server")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommands(vec![
            SubCommand::with_name("get")
                .about("Print a whole collection")
                .arg(collection_arg.clone())
                .arg(addr_arg.clone()),
            SubCommand::with_name("put")
                .about("Shallow-merge a JSON object into a collection")
                .arg(collection_arg)
                .arg(Arg::with_name("JSON").required(true).index(2))
                .arg(addr_arg.clone()),
            simple("backup", "Queue a snapshot of every collection"),
            simple("export", "Queue a CSV export"),
            simple("clear-all", "Snapshot, then clear every collection"),
            simple("restart", "Snapshot, then clear guesses and results"),
            simple("stats", "Print aggregate counters"),
            simple("winners", "Print every guess joined with the actual average"),
            simple("snapshots", "List snapshots, newest first"),
            SubCommand::with_name("restore")
                .about("Replace every collection with the content of a snapshot")
                .arg(Arg::with_name("SNAPSHOT").required(true).index(1))
                .arg(addr_arg.clone()),
            simple("health", "Print the server's health report"),
        ])
        .get_matches();

    let result = parse_options(&matches).and_then(run);
    if let Err(e) = result {
        eprintln!("{}", e);
        exit(1);
    }
}

/// runs the specified request on the [`PredictionClient`] and prints the response as JSON
/// `opt` contains the server address and the request type to execute
fn run(opt: Opt) -> Result<()> {
    let mut client = PredictionClient::connect(opt.addr)?;
    debug!("sending {:?} to {}", opt.req, opt.addr);
    let value = client.send(&opt.req)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// parses the matches from the command line into an [`Opt`] struct
fn parse_options(matches: &ArgMatches) -> Result<Opt> {
    let (name, args) = match matches.subcommand() {
        (name, Some(args)) => (name, args),
        (name, None) => return Err(StoreError::Parsing(format!("unknown command {}", name))),
    };
    let addr = args.value_of("addr").unwrap_or(DEFAULT_ADDRESS);

    let req = match name {
        "get" => Request::Get {
            collection: collection(args)?,
        },
        "put" => {
            let json = args.value_of("JSON").unwrap_or_default();
            let delta: Value = serde_json::from_str(json)
                .map_err(|e| StoreError::Parsing(format!("invalid JSON: {}", e)))?;
            Request::Put {
                collection: collection(args)?,
                delta,
            }
        }
        "backup" => Request::Backup,
        "export" => Request::Export,
        "clear-all" => Request::ClearAll,
        "restart" => Request::Restart,
        "stats" => Request::Stats,
        "winners" => Request::Winners,
        "snapshots" => Request::Snapshots,
        "restore" => Request::Restore {
            snapshot: args.value_of("SNAPSHOT").unwrap_or_default().to_string(),
        },
        "health" => Request::Health,
        other => return Err(StoreError::Parsing(format!("unknown command {}", other))),
    };
    Opt::build(addr, req)
}

fn collection(args: &ArgMatches) -> Result<CollectionName> {
    args.value_of("COLLECTION").unwrap_or_default().parse()
}

/// configures a tracing subscriber that will log warnings and errors to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("setting tracing default subscriber failed");
    }
}
