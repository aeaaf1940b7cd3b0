use fleet_node::Settings;
use std::process::ExitCode;

fn main() -> ExitCode {
    // Parse before the runtime starts so `--help` and usage errors exit cleanly
    let settings = Settings::from_cli();
    node_entrypoints::run_native("Fleet Node", move || fleet_node::run(settings))
}
