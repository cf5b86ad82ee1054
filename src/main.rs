//! Binary entrypoint that launches the terminal chat client.

use std::process::ExitCode;

use galaxy_chat::start_chat_client;

/// Connect with `GALAXY_TOKEN` and chat from the terminal.
fn main() -> ExitCode {
    start_chat_client::run()
}
