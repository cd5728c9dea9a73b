#[macro_use] extern crate clap;

use clap::{App, Arg, ArgMatches};
use storlets_protocol::SBus;
use storlets_sand::{errors::SandError, identity, logging, server, StorletDaemon};

fn main() {
    let matches = App::new("storlets-daemon")
        .version(crate_version!())
        .about("Runs one storlet, forking a worker per invocation")
        .arg(Arg::with_name("storlet_name").required(true).index(1))
        .arg(Arg::with_name("sbus_path").required(true).index(2))
        .arg(Arg::with_name("log_level").required(true).index(3))
        .arg(Arg::with_name("pool_size").required(true).index(4))
        .arg(Arg::with_name("container_id").required(true).index(5))
        .arg(
            Arg::with_name("user")
                .long("user")
                .takes_value(true)
                .help("Account to switch to before serving"),
        )
        .arg(
            Arg::with_name("storlet_path")
                .long("storlet-path")
                .takes_value(true)
                .env("STORLET_PATH")
                .help("Code path searched for executable storlets"),
        )
        .get_matches();

    logging::init(
        matches.value_of("log_level").unwrap(),
        matches.value_of("container_id").unwrap(),
        matches.value_of("storlet_name").unwrap(),
    );

    if let Err(err) = run(&matches) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<(), SandError> {
    let pool_size = value_t!(matches, "pool_size", usize).unwrap_or_else(|e| e.exit());
    if let Some(user) = matches.value_of("user") {
        identity::switch_user(user)?;
    }

    let sbus = SBus::create(matches.value_of("sbus_path").unwrap())?;
    let mut daemon = StorletDaemon::new(matches.value_of("storlet_name").unwrap(), pool_size);
    if let Some(path) = matches.value_of("storlet_path") {
        daemon = daemon.storlet_path(path);
    }
    server::serve(&sbus, &mut daemon)
}
