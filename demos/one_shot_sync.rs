//! Example: one shadow synchronization from the command line
//!
//! Settings come from `--flag value` arguments first and the process
//! environment second. A configuration error exits with status 2 before any
//! connection is attempted; every other failure exits with the status
//! [`SyncError::exit_code`] assigns to it.
//!
//! # Note
//!
//! Opening the TLS session and the I2C bus is board specific, so `main`
//! stops after loading the configuration. [`synchronize`] shows the rest of a
//! run for any [`Connector`] and any async I2C bus.

use std::process::exit;

use embedded_hal_async::i2c::I2c;
use myrtio_shadow::config::USAGE;
use myrtio_shadow::{
    AgentConfig, ArgsSource, CancelToken, Connector, Layered, LogSink, MapSource, Mcp9808,
    ShadowAck, ShadowSync, SyncError, SyncOptions,
};

/// Reads the MCP9808 once, reports the value and waits for the shadow to
/// accept it.
pub async fn synchronize<C, I>(
    config: AgentConfig<'_>,
    connector: C,
    i2c: I,
) -> Result<ShadowAck, SyncError>
where
    C: Connector,
    I: I2c,
{
    let mut sync: ShadowSync<'_, _, _, _> =
        ShadowSync::new(config, connector, Mcp9808::new(i2c), LogSink)
            .with_options(SyncOptions::default());
    sync.run(&CancelToken::new()).await
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let env: Vec<(String, String)> = std::env::vars().collect();
    let env: Vec<(&str, &str)> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let source = Layered::new(ArgsSource::new(&args), MapSource::new(&env));
    let config = match AgentConfig::load(&source) {
        Ok(config) => config,
        Err(e) => {
            let error = SyncError::from(e);
            eprintln!("{error}\n\n{USAGE}");
            exit(i32::from(error.exit_code()));
        }
    };

    println!(
        "would report to {}:{} as {}",
        config.endpoint.host, config.endpoint.port, config.thing_name
    );
    // With a board connector and bus in hand:
    // match block_on(synchronize(config, connector, i2c)) {
    //     Ok(ack) => println!("temperature={} version={}", ack.temperature, ack.version),
    //     Err(e) => exit(i32::from(e.exit_code())),
    // }
}
