//! ferry-monitor CLI: watches table freshness and requests fallback syncs.

use std::process::ExitCode;

use ferry_core::Application;
use ferry_monitor::Config;

fn main() -> ExitCode {
    Application::<Config>::run()
}
