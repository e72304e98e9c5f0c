//! Encab binary entrypoint.
//!
//! Loads the configuration, sets up the logger, and hands control to the
//! supervisor. Positional arguments override the `main` program's command:
//!
//! ```text
//! encab [program-override-argv...]
//! ```
//!
//! Configuration errors are the only thing printed to stderr; everything else
//! goes through the tagged log stream on stdout.

use encab::config;
use encab::logging::{LogFormat, Logger};
use encab::Supervisor;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let (config, location) = match config::load() {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("Error in configuration: {err}");
            std::process::exit(1);
        }
    };

    let logger = Logger::stdout(LogFormat::parse(config.encab.effective_logformat()));
    let elog = logger.for_program(encab::logging::ENCAB, config.encab.effective_loglevel());
    elog.info(format!("encab {}", env!("CARGO_PKG_VERSION"))).await;
    elog.debug(format!("Using configuration {location}")).await;

    let code = Supervisor::new(config, logger).run(args).await;
    std::process::exit(code);
}
