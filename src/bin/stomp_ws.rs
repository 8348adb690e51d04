use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stomp_ws::{Config, Error};

/// Exit codes for different error conditions
mod exit_codes {
    /// Successful execution
    pub const SUCCESS: u8 = 0;
    /// Network error (host unreachable, connection lost, heartbeat timeout)
    pub const NETWORK_ERROR: u8 = 1;
    /// Authentication error (credentials rejected by the broker)
    pub const AUTH_ERROR: u8 = 2;
    /// Protocol error (malformed frame or unexpected server response)
    pub const PROTOCOL_ERROR: u8 = 3;
    /// Invalid command-line configuration
    pub const CONFIG_ERROR: u8 = 4;
}

#[derive(Parser)]
#[command(name = "stomp-ws")]
#[command(version)]
#[command(about = "STOMP-over-WebSocket client")]
struct Cli {
    /// Broker hostname
    #[arg(long)]
    host: String,

    /// Broker WebSocket port
    #[arg(long, default_value_t = 61614)]
    port: u16,

    /// Destination to subscribe or publish to (e.g. /topic/events)
    #[arg(short, long)]
    destination: String,

    /// Login username
    #[arg(short, long)]
    username: String,

    /// Passcode
    #[arg(short, long)]
    password: String,

    /// Connect over TLS (wss://)
    #[arg(long)]
    tls: bool,

    /// Skip TLS certificate verification (requires --tls)
    #[arg(long)]
    insecure: bool,

    /// Speak SockJS framing on top of the WebSocket
    #[arg(long)]
    sockjs: bool,

    /// Publish this payload once and exit instead of subscribing
    #[arg(long, value_name = "PAYLOAD")]
    send: Option<String>,

    /// Flatten a key=value payload into a JSON object before sending
    #[arg(long)]
    json: bool,

    /// Heartbeat interval in milliseconds, 0 to disable
    #[arg(long, default_value_t = 10_000)]
    heartbeat: u64,

    /// Verbose logging, and print message headers alongside bodies
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            host: self.host,
            port: self.port,
            destination: self.destination,
            username: self.username,
            password: self.password,
            use_tls: self.tls,
            insecure_tls: self.insecure,
            use_sockjs: self.sockjs,
            payload: self.send,
            json_encode: self.json,
            heartbeat_ms: self.heartbeat,
            debug: self.debug,
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    // logs go to stderr so stdout stays clean for message bodies
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::Connect(_) | Error::Send(_) | Error::HeartbeatTimeout(_) => {
            exit_codes::NETWORK_ERROR
        }
        Error::Auth(_) => exit_codes::AUTH_ERROR,
        Error::MalformedFrame(_) | Error::Protocol(_) => exit_codes::PROTOCOL_ERROR,
        Error::Config(_) => exit_codes::CONFIG_ERROR,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = cli.into_config();
    match stomp_ws::driver::run(&config).await {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS),
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
