//! Ferry CLI: scheduled and triggered table syncs.

use std::process::ExitCode;

use ferry::{Application, Config};

fn main() -> ExitCode {
    Application::<Config>::run()
}
