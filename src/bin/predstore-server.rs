//! this binary starts the prediction store server
//! to see the list of options, type: `predstore-server --help`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

use clap::{arg_enum, crate_version, value_t, App, Arg};
use predstore::config::{self, load_course_names};
use predstore::{
    PredictionServer, RayonThreadPool, Result, Service, SharedQueueThreadPool, StoreConfig,
    StoreError, ThreadPool,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

arg_enum! {
    #[allow(non_camel_case_types)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum Pool {
        rayon,
        shared
    }
}

const DEFAULT_ADDRESS: &str = "127.0.0.1:4000";
const DEFAULT_POOL: Pool = Pool::rayon;
const DEFAULT_THREADS: u32 = 4;

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    addr: SocketAddr,
    pool: Pool,
    threads: u32,
    config: StoreConfig,
}

impl Opt {
    /// validates the `addr` parameter and loads the optional course name table
    /// # Errors
    /// returns [`StoreError::Parsing`] if one of the parameters is invalid
    fn build(addr: &str, pool: Pool, threads: u32, config: StoreConfig) -> Result<Opt> {
        let addr: SocketAddr = addr.parse().map_err(|_| {
            StoreError::Parsing(format!("could not parse {} into an IP addess and port", &addr))
        })?;
        if threads == 0 {
            return Err(StoreError::Parsing("--threads must be at least 1".to_string()));
        }

        Ok(Opt {
            addr,
            pool,
            threads,
            config,
        })
    }
}

fn main() {
    let matches = App::new("predstore-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("a concurrent, file-backed store for exam average predictions")
        .arg(Arg::with_name("addr")
            .long("addr")
            .value_name("IP_ADDR:PORT")
            .help("sets the IP_ADDR:PORT that the server listens on")
            .default_value(DEFAULT_ADDRESS))
        .arg(Arg::with_name("data-dir")
            .long("data-dir")
            .value_name("DIR")
            .help("sets the directory holding the collection files")
            .default_value(config::DEFAULT_DATA_DIR))
        .arg(Arg::with_name("backup-interval")
            .long("backup-interval")
            .value_name("SECONDS")
            .help("sets the period of the recurring backup"))
        .arg(Arg::with_name("keep-backups")
            .long("keep-backups")
            .value_name("COUNT")
            .help("sets how many snapshots are retained"))
        .arg(Arg::with_name("threads")
            .long("threads")
            .value_name("COUNT")
            .help("sets the number of threads serving requests"))
        .arg(Arg::with_name("pool")
            .long("pool")
            .value_name("POOL")
            .possible_values(&Pool::variants())
            .help("sets the thread pool serving requests, either 'rayon' or 'shared'")
            .default_value("rayon"))
        .arg(Arg::with_name("course-names")
            .long("course-names")
            .value_name("FILE")
            .help("a JSON object mapping course keys to course names, used by the exports"))
        .arg(Arg::with_name("no-export-on-write")
            .long("no-export-on-write")
            .help("don't export the CSV tables after every write to guesses or results"))
        .arg(Arg::with_name("log-level")
            .long("log-level")
            .value_name("LEVEL")
            .help("sets the most verbose level logged to stderr")
            .default_value("info"))
        .get_matches();

    // set up a tracing subscriber to log to STDERR
    let level = value_t!(matches, "log-level", Level).unwrap_or(Level::INFO);
    subscriber_config(level);

    let mut config = StoreConfig::new(PathBuf::from(matches.value_of("data-dir").unwrap_or(config::DEFAULT_DATA_DIR)));
    if let Ok(secs) = value_t!(matches, "backup-interval", u64) {
        config.backup_interval = Duration::from_secs(secs);
    }
    if let Ok(keep) = value_t!(matches, "keep-backups", usize) {
        config.keep_backups = keep;
    }
    config.export_on_write = !matches.is_present("no-export-on-write");
    if let Some(path) = matches.value_of("course-names") {
        match load_course_names(Path::new(path)) {
            Ok(names) => config.course_names = names,
            Err(e) => {
                eprintln!("{}", e);
                exit(1);
            }
        }
    }

    let addr = matches.value_of("addr").unwrap_or(DEFAULT_ADDRESS);
    let pool = value_t!(matches, "pool", Pool).unwrap_or(DEFAULT_POOL);
    let threads = value_t!(matches, "threads", u32).unwrap_or(DEFAULT_THREADS);
    let opt = match Opt::build(addr, pool, threads, config) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{}", err);
            exit(1);
        }
    };

    // start the server
    if let Err(e) = run(opt) {
        eprintln!("{}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("predstore-server {}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", opt.config.data_dir);
    info!("Thread pool: {} with {} threads", opt.pool, opt.threads);

    let service = Service::open(opt.config)?;
    service.start()?;

    match opt.pool {
        Pool::rayon => run_with_pool(service, RayonThreadPool::new(opt.threads)?, opt.addr),
        Pool::shared => run_with_pool(service, SharedQueueThreadPool::new(opt.threads)?, opt.addr),
    }
}

/// runs the server until it stops; queued backups and exports are drained on every exit path
fn run_with_pool<P: ThreadPool>(service: Service, pool: P, addr: SocketAddr) -> Result<()> {
    let server = PredictionServer::new(service.clone(), pool);
    let served = server.run(addr);
    if served.is_err() {
        // `run` only drains after a clean stop
        service.shutdown();
    }
    served
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config(level: Level) {
    let subscriber = FmtSubscriber::builder()
        // spans/events more verbose than `level` are discarded
        .with_max_level(level)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("setting tracing default subscriber failed");
    }
}
