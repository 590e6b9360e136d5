//! this binary starts a depot server
//! to see the list of options, type: `depot-server --help`
//!
//! Settings come from an optional JSON file given with `--config`; flags on the command line
//! override it.

use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use depot::config::{DepotConfig, PoolKind, TlsPaths};
use depot::logging::{self, LogControl, LogOptions};
use depot::peer::parse_peer_list;
use depot::{
    Authenticator, Connector, Depot, DepotError, DepotServer, MemoryStore, NaiveThreadPool,
    PlainAuthenticator, RayonThreadPool, Result, SharedQueueThreadPool, ThreadPool,
};
use tracing::{error, info, warn};

fn main() {
    let matches = app().get_matches();

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    let log = match logging::init(&LogOptions {
        file: config.log_file.clone(),
        filter: config.log_filter.clone(),
    }) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    if let Err(e) = run(config, log) {
        error!("{}", e);
        eprintln!("{}", e);
        exit(1);
    }
}

fn app() -> App<'static, 'static> {
    let app = App::new("depot-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("a monitoring depot server")
        .arg(Arg::with_name("config")
            .long("config")
            .value_name("FILE")
            .help("reads settings from a JSON file"))
        .arg(Arg::with_name("addr")
            .long("addr")
            .value_name("IP_ADDR:PORT")
            .help("sets the IP_ADDR:PORT that the server listens on, 127.0.0.1:6324 unless configured"))
        .arg(Arg::with_name("var-dir")
            .long("var-dir")
            .value_name("DIR")
            .help("directory for permissions, the delayed work queue and sync downloads"))
        .arg(Arg::with_name("threads")
            .long("threads")
            .value_name("N")
            .help("number of connection threads for the shared and rayon pools"))
        .arg(Arg::with_name("pool")
            .long("pool")
            .value_name("POOL")
            .possible_values(&["shared", "naive", "rayon"])
            .help("the thread pool serving connections, naive (a thread per connection) unless configured"))
        .arg(Arg::with_name("workers")
            .long("workers")
            .value_name("N")
            .help("number of threads applying queued work"))
        .arg(Arg::with_name("queue-size")
            .long("queue-size")
            .value_name("N")
            .help("maximum number of jobs waiting on the work queue"))
        .arg(Arg::with_name("peers")
            .long("peers")
            .value_name("URIS")
            .help("peer depots, separated by spaces, commas or semicolons"))
        .arg(Arg::with_name("local-uri")
            .long("local-uri")
            .value_name("URI")
            .help("the URI peers reach this depot at"))
        .arg(Arg::with_name("recover")
            .long("recover")
            .help("resubmits work left in the delayed queue by a previous run"))
        .arg(Arg::with_name("sync")
            .long("sync")
            .help("pulls a snapshot from a peer at startup"))
        .arg(Arg::with_name("dump")
            .long("dump")
            .conflicts_with("sync")
            .help("downloads a snapshot from a peer and exits"))
        .arg(Arg::with_name("log-file")
            .long("log-file")
            .value_name("FILE")
            .help("appends logs to FILE instead of stderr"))
        .arg(Arg::with_name("log-filter")
            .long("log-filter")
            .value_name("DIRECTIVES")
            .help("tracing filter directives, e.g. 'debug' or 'depot::sync=trace'"))
        .arg(Arg::with_name("read-timeout")
            .long("read-timeout")
            .value_name("SECS")
            .help("seconds a read from a peer may block before it is retried"));

    if cfg!(feature = "tls") {
        app.arg(Arg::with_name("cert")
                .long("cert")
                .value_name("PEM")
                .requires_all(&["key", "trusted"])
                .help("serves and connects over TLS with this certificate chain"))
            .arg(Arg::with_name("key")
                .long("key")
                .value_name("PEM")
                .requires("cert")
                .help("the private key for --cert"))
            .arg(Arg::with_name("trusted")
                .long("trusted")
                .value_name("PEM")
                .requires("cert")
                .help("CA certificates trusted to sign client and peer certificates"))
    } else {
        app
    }
}

/// reads the config file, if any, then applies the command line on top of it
fn build_config(matches: &ArgMatches) -> Result<DepotConfig> {
    let mut config = match matches.value_of("config") {
        Some(path) => DepotConfig::load(Path::new(path))?,
        None => DepotConfig::default(),
    };

    if let Some(addr) = matches.value_of("addr") {
        config.addr = addr.parse::<SocketAddr>().map_err(|_| {
            DepotError::Config(format!("could not parse {} into an IP address and port", addr))
        })?;
    }
    if let Some(dir) = matches.value_of("var-dir") {
        config.var_dir = dir.into();
    }
    if matches.is_present("threads") {
        config.threads = value_t!(matches, "threads", u32).map_err(bad_arg)?;
    }
    if let Some(pool) = matches.value_of("pool") {
        config.pool = pool.parse::<PoolKind>()?;
    }
    if matches.is_present("workers") {
        config.workers = value_t!(matches, "workers", usize).map_err(bad_arg)?;
    }
    if matches.is_present("queue-size") {
        config.queue_size = Some(value_t!(matches, "queue-size", usize).map_err(bad_arg)?);
    }
    if let Some(peers) = matches.value_of("peers") {
        config.peers = parse_peer_list(peers);
    }
    if let Some(uri) = matches.value_of("local-uri") {
        config.local_uri = Some(uri.to_string());
    }
    config.recover |= matches.is_present("recover");
    config.sync |= matches.is_present("sync");
    config.dump |= matches.is_present("dump");
    if let Some(file) = matches.value_of("log-file") {
        config.log_file = Some(file.into());
    }
    if let Some(filter) = matches.value_of("log-filter") {
        config.log_filter = Some(filter.to_string());
    }
    if matches.is_present("read-timeout") {
        config.read_timeout_secs = Some(value_t!(matches, "read-timeout", u64).map_err(bad_arg)?);
    }
    if let (Some(cert), Some(key), Some(trusted)) = (
        matches.value_of("cert"),
        matches.value_of("key"),
        matches.value_of("trusted"),
    ) {
        config.tls = Some(TlsPaths {
            cert: cert.into(),
            key: key.into(),
            trusted: trusted.into(),
        });
    }

    config.validate()?;
    Ok(config)
}

fn bad_arg(e: clap::Error) -> DepotError {
    DepotError::Config(e.message)
}

fn run(config: DepotConfig, log: LogControl) -> Result<()> {
    info!("depot-server {}", env!("CARGO_PKG_VERSION"));
    let depot = Depot::open(
        config.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(log),
        connector(&config)?,
    )?;

    if config.dump {
        let path = depot.dump_sync_data()?;
        println!("{}", path.display());
        return Ok(());
    }

    depot.recover()?;
    if config.sync {
        // lock before anything can arrive, so nothing races the snapshot
        depot.sync().start_sync_request()?;
    }
    depot.start_workers()?;

    let listener = TcpListener::bind(config.addr)?;
    info!("Connection pool: {} with {} threads", config.pool, config.threads);
    match config.pool {
        PoolKind::Shared => serve(&depot, listener, SharedQueueThreadPool::new(config.threads)?, &config),
        PoolKind::Naive => serve(&depot, listener, NaiveThreadPool::new(config.threads)?, &config),
        PoolKind::Rayon => serve(&depot, listener, RayonThreadPool::new(config.threads)?, &config),
    }
}

/// runs the accept loop while registering with peers and, if asked, synchronizing
fn serve<P: ThreadPool>(depot: &Arc<Depot>, listener: TcpListener, pool: P, config: &DepotConfig) -> Result<()> {
    let server = DepotServer::new(depot.registry(), pool).with_authenticator(authenticator(config)?);
    depot.attach_server(server.shutdown_handle());
    let server = &server;

    let served = crossbeam::scope(|scope| {
        let accept = scope.spawn(move |_| server.run_on(listener));

        let registered = depot.register_with_peers();
        info!("Registered with {} of {} peers", registered, depot.peers().len());
        if depot.sync().requesting_sync() {
            if let Err(e) = depot.synchronize() {
                warn!("Continuing without synchronizing: {}", e);
            }
        }

        accept.join()
    });

    let result = match served {
        Ok(Ok(result)) => result,
        _ => Err(DepotError::Config("server thread panicked".into())),
    };
    depot.shutdown();
    result
}

fn connector(config: &DepotConfig) -> Result<Connector> {
    let mut connector = Connector::new();
    if let Some(secs) = config.read_timeout_secs {
        connector = connector.read_timeout(Duration::from_secs(secs), depot::client::DEFAULT_READ_RETRIES);
    }
    #[cfg(feature = "tls")]
    if let Some(paths) = &config.tls {
        connector = connector.tls(Arc::new(depot::tls::ClientTls::new(paths)?));
    }
    #[cfg(not(feature = "tls"))]
    if config.tls.is_some() {
        return Err(DepotError::Config("built without tls support".into()));
    }
    Ok(connector)
}

fn authenticator(config: &DepotConfig) -> Result<Arc<dyn Authenticator>> {
    #[cfg(feature = "tls")]
    if let Some(paths) = &config.tls {
        return Ok(Arc::new(depot::tls::TlsAuthenticator::new(paths)?));
    }
    #[cfg(not(feature = "tls"))]
    if config.tls.is_some() {
        return Err(DepotError::Config("built without tls support".into()));
    }
    Ok(Arc::new(PlainAuthenticator))
}
