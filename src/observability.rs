use std::str::FromStr;
use tracing::Level;

/// Installs the global fmt subscriber. Unknown levels fall back to info.
pub fn init_tracing(level: &str) {
    let max_level = Level::from_str(level).unwrap_or(Level::INFO);
    if let Err(err) = tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .try_init()
    {
        eprintln!("tracing already initialised: {err}");
    }
}
