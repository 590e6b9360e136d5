//! The depot-client executable sends one command to a depot and prints the reply:
//!
//! `depot-client ping [TEXT] [--addr IP-PORT]`
//!
//!     Checks the server is alive. Prints the echoed text.
//!
//! `depot-client start`
//!
//!     Checks the server speaks this client's protocol version.
//!
//! `depot-client permit <ACTION> <NAME>...`, `depot-client revoke <NAME> <ACTION>`,
//! `depot-client revokeall <ACTION>`
//!
//!     Grants or takes away permission to perform ACTION. NAME is a certificate subject.
//!
//! `depot-client report <RESOURCE> <CONTEXT> <STDOUT_FILE> [--sysusage TEXT] [--stderr TEXT]`,
//! `depot-client suite <FILE>`
//!
//!     Uploads a report or a suite update document.
//!
//! `depot-client getlog`, `depot-client logconfig <property=value>`
//!
//!     Reads or changes the server's logging.
//!
//! `depot-client register <URI>`, `depot-client dump <FILE>`
//!
//!     Depot to depot operations: registers URI as a peer (printing the permission document the
//!     server answers with), or saves a base64 snapshot of the server's data to FILE.
//!
//! --addr defaults to 127.0.0.1:6324. A server error prints the message and exits non-zero.

use std::fs;
use std::path::Path;
use std::process::exit;
use std::time::Duration;

use clap::{crate_version, value_t, App, AppSettings, Arg, ArgMatches, SubCommand};
use depot::client::DEFAULT_READ_RETRIES;
use depot::config::DEFAULT_ADDRESS;
use depot::logging::{self, LogOptions};
use depot::{Connector, DepotClient, DepotError, Report, Result};

fn main() {
    let matches = App::new("depot-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("sends commands to a monitoring depot")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("addr")
            .long("addr")
            .value_name("IP_ADDR:PORT")
            .help("sets the IP_ADDR:PORT of the server to connect to")
            .default_value(DEFAULT_ADDRESS)
            .global(true))
        .arg(Arg::with_name("timeout")
            .long("timeout")
            .value_name("SECS")
            .help("seconds a read may block before it is retried")
            .global(true))
        .subcommands(vec![
            SubCommand::with_name("ping")
                .about("checks the server is alive")
                .arg(Arg::with_name("TEXT").index(1).default_value("ping")),
            SubCommand::with_name("start")
                .about("checks the server speaks this protocol version"),
            SubCommand::with_name("permit")
                .about("grants ACTION to each NAME")
                .arg(Arg::with_name("ACTION").required(true).index(1))
                .arg(Arg::with_name("NAME").required(true).multiple(true).index(2)),
            SubCommand::with_name("revoke")
                .about("takes ACTION away from NAME")
                .arg(Arg::with_name("NAME").required(true).index(1))
                .arg(Arg::with_name("ACTION").required(true).index(2)),
            SubCommand::with_name("revokeall")
                .about("takes ACTION away from everyone")
                .arg(Arg::with_name("ACTION").required(true).index(1)),
            SubCommand::with_name("report")
                .about("uploads a report")
                .arg(Arg::with_name("RESOURCE").required(true).index(1))
                .arg(Arg::with_name("CONTEXT").required(true).index(2))
                .arg(Arg::with_name("STDOUT_FILE").required(true).index(3))
                .arg(Arg::with_name("stderr").long("stderr").value_name("TEXT"))
                .arg(Arg::with_name("sysusage").long("sysusage").value_name("TEXT"))
                .arg(Arg::with_name("target").long("target").value_name("RESOURCE")),
            SubCommand::with_name("suite")
                .about("uploads a suite update document")
                .arg(Arg::with_name("FILE").required(true).index(1)),
            SubCommand::with_name("getlog")
                .about("prints the server's log"),
            SubCommand::with_name("logconfig")
                .about("changes the server's logging, e.g. level=debug")
                .arg(Arg::with_name("SETTING").required(true).index(1)),
            SubCommand::with_name("register")
                .about("registers URI as a peer depot")
                .arg(Arg::with_name("URI").required(true).index(1)),
            SubCommand::with_name("dump")
                .about("saves a snapshot of the server's data")
                .arg(Arg::with_name("FILE").required(true).index(1)),
        ])
        .get_matches();

    // only warnings by default, the reply goes to stdout
    if let Err(e) = logging::init(&LogOptions {
        file: None,
        filter: Some("warn".into()),
    }) {
        eprintln!("{}", e);
    }

    if let Err(e) = run(&matches) {
        eprintln!("{}", e);
        exit(1);
    }
}

/// connects to the server and runs the requested subcommand
fn run(matches: &ArgMatches) -> Result<()> {
    let (name, args) = match matches.subcommand() {
        (name, Some(args)) => (name, args),
        _ => return Err(DepotError::Config("no command given".into())),
    };
    let mut client = connect(matches, args)?;

    match name {
        "ping" => println!("{}", client.ping(arg(args, "TEXT")?)?),
        "start" => println!("{}", client.start()?),
        "permit" => {
            let names: Vec<&str> = args.values_of("NAME").map(|v| v.collect()).unwrap_or_default();
            client.permit(&names, arg(args, "ACTION")?)?;
        }
        "revoke" => client.revoke(arg(args, "NAME")?, arg(args, "ACTION")?)?,
        "revokeall" => client.revoke_all(arg(args, "ACTION")?)?,
        "report" => {
            let report = Report {
                resource: arg(args, "RESOURCE")?.to_string(),
                context: arg(args, "CONTEXT")?.to_string(),
                target: args.value_of("target").map(String::from),
                stderr: args.value_of("stderr").map(String::from),
                stdout: fs::read_to_string(arg(args, "STDOUT_FILE")?)?,
                sysusage: args.value_of("sysusage").unwrap_or_default().to_string(),
            };
            println!("{}", client.send_report(&report)?);
        }
        "suite" => {
            let xml = fs::read_to_string(arg(args, "FILE")?)?;
            client.send_suite(&xml)?;
        }
        "getlog" => print!("{}", client.get_log()?),
        "logconfig" => client.log_config(arg(args, "SETTING")?)?,
        "register" => println!("{}", client.register_peer(arg(args, "URI")?)?),
        "dump" => {
            let path = Path::new(arg(args, "FILE")?);
            let bytes = client.request_sync(true, path)?;
            println!("saved {} bytes to {}", bytes, path.display());
        }
        other => return Err(DepotError::Config(format!("unknown command {}", other))),
    }
    Ok(())
}

// global options may be given before or after the subcommand
fn connect(matches: &ArgMatches, args: &ArgMatches) -> Result<DepotClient> {
    let options = if args.occurrences_of("addr") > 0 || args.is_present("timeout") {
        args
    } else {
        matches
    };
    let addr = arg(options, "addr")?;
    let mut connector = Connector::new();
    if options.is_present("timeout") {
        let secs = value_t!(options, "timeout", u64).map_err(|e| DepotError::Config(e.message))?;
        connector = connector.read_timeout(Duration::from_secs(secs), DEFAULT_READ_RETRIES);
    }
    connector.connect(addr)
}

fn arg<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.value_of(name)
        .ok_or_else(|| DepotError::Config(format!("missing argument {}", name)))
}
