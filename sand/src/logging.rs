use env_logger::{Builder, Env};
use std::io::Write;

/// Map the level names used on daemon command lines to a log filter
pub fn filter_for(level: &str) -> &'static str {
    match level.to_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        "OFF" => "off",
        _ => "info",
    }
}

/// Log to stderr, each line tagged with the container and process role
pub fn init(level: &str, container_id: &str, name: &str) {
    let prefix = format!("{} {}", container_id, name);
    let _ = Builder::from_env(Env::default().default_filter_or(filter_for(level)))
        .format(move |buf, record| {
            writeln!(
                buf,
                "{} {} {}: {}",
                prefix,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
