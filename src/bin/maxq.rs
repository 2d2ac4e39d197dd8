use maxq::app::{help_text, parse_cli_options};
use maxq::config::Settings;
use maxq::runtime;

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = parse_cli_options(&args)?;
    if options.help {
        println!("{}", help_text());
        return Ok(());
    }

    let settings = Settings::resolve(&options).map_err(|err| err.to_string())?;
    let server = runtime::start_server(settings).map_err(|err| err.to_string())?;
    println!("maxq listening on {}", server.addr());

    runtime::wait_for_shutdown_signal().map_err(|err| err.to_string())?;
    server.shutdown();
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
