#[macro_use]
extern crate clap;

use clap::App;
use env_logger::{from_env, Env};
use storlets_protocol::SBusClient;

fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap();
    from_env(Env::default().default_filter_or(log_level)).init();

    let client = SBusClient::new(matches.value_of("channel").unwrap());
    let result = match matches.subcommand() {
        ("ping", _) => client.ping(),
        ("halt", _) => client.halt(),
        ("stop-daemons", _) => client.stop_daemons(),
        ("daemon-status", Some(sub)) => {
            client.daemon_status(sub.value_of("storlet_name").unwrap())
        }
        ("stop-daemon", Some(sub)) => client.stop_daemon(sub.value_of("storlet_name").unwrap()),
        ("cancel", Some(sub)) => client.cancel(sub.value_of("task_id").unwrap()),
        (other, _) => unreachable!("unknown subcommand {:?}", other),
    };

    match result {
        Ok(reply) => {
            println!("{}", serde_json::to_string(&reply).unwrap());
            if !reply.status {
                std::process::exit(1);
            }
        }
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(0xFF);
        }
    }
}
