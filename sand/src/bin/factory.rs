#[macro_use] extern crate clap;

use clap::{App, Arg, ArgMatches};
use storlets_protocol::SBus;
use storlets_sand::{errors::SandError, identity, launch::Launcher, logging, server, DaemonFactory};

fn main() {
    let matches = App::new("storlets-daemon-factory")
        .version(crate_version!())
        .about("Starts and stops storlet daemons inside one sandbox")
        .arg(Arg::with_name("sbus_path").required(true).index(1))
        .arg(Arg::with_name("log_level").required(true).index(2))
        .arg(Arg::with_name("container_id").required(true).index(3))
        .arg(
            Arg::with_name("user")
                .long("user")
                .takes_value(true)
                .help("Account to switch to before serving"),
        )
        .arg(
            Arg::with_name("native_daemon")
                .long("native-daemon")
                .takes_value(true)
                .help("Daemon binary used for native storlets"),
        )
        .arg(
            Arg::with_name("log_relay")
                .long("log-relay")
                .takes_value(true)
                .help("Command that receives each daemon's stderr, e.g. logger"),
        )
        .get_matches();

    logging::init(
        matches.value_of("log_level").unwrap(),
        matches.value_of("container_id").unwrap(),
        "daemon-factory",
    );

    if let Err(err) = run(&matches) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<(), SandError> {
    if let Some(user) = matches.value_of("user") {
        identity::switch_user(user)?;
    }

    let mut launcher = Launcher::new(matches.value_of("container_id").unwrap());
    if let Some(path) = matches.value_of("native_daemon") {
        launcher = launcher.native_daemon(path);
    }
    let mut factory = DaemonFactory::new(launcher);
    if let Some(relay) = matches.value_of("log_relay") {
        factory = factory.log_relay(relay.split_whitespace().map(String::from).collect());
    }

    let sbus = SBus::create(matches.value_of("sbus_path").unwrap())?;
    server::serve(&sbus, &mut factory)
}
