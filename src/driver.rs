use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::error::Error;
use crate::frame::Frame;
use crate::session::Session;

/// Buffer between the session and the stdout printer.
const SINK_CAPACITY: usize = 32;

/// Run one client session to completion.
///
/// Listen mode prints every delivered MESSAGE body to stdout (headers too
/// when `config.debug` is set) until Ctrl-C requests a graceful stop; send
/// mode publishes the configured payload and returns. The session's terminal
/// state is reflected in the returned `Result`.
pub async fn run(config: &Config) -> Result<(), Error> {
    let mut session = Session::new(config)?;

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            stop.stop();
        }
    });

    let (sink_tx, mut sink_rx) = mpsc::channel::<Frame>(SINK_CAPACITY);
    let with_headers = config.debug;
    let printer = tokio::spawn(async move {
        while let Some(frame) = sink_rx.recv().await {
            print_message(&frame, with_headers);
        }
    });

    let outcome = session.start(sink_tx).await;
    // start() consumed the sink sender, so the printer drains and ends here
    let _ = printer.await;
    outcome
}

fn print_message(frame: &Frame, with_headers: bool) {
    if with_headers {
        for (name, value) in &frame.headers {
            println!("{}: {}", name, value);
        }
        println!();
    }
    println!("{}", frame.body_text());
}
