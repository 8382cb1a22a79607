//! Admin client: `hashmill-api [command [host [port]]]`.

use std::process::ExitCode;
use std::time::Duration;

use hashmill::api;
use hashmill::config::DEFAULT_API_PORT;

const DEFAULT_COMMAND: &str = "summary";
const DEFAULT_HOST: &str = "127.0.0.1";
const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
struct Args {
    command: String,
    host: String,
    port: u16,
}

#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    Run(Args),
    Help,
    BadPort(String),
}

/// Blank arguments fall back to the defaults.
fn parse_args(argv: &[String]) -> Parsed {
    let arg = |i: usize| argv.get(i).map(|a| a.trim()).filter(|a| !a.is_empty());
    if let Some("-h" | "--help" | "-?") = arg(1) {
        return Parsed::Help;
    }
    let port = match arg(3) {
        None => DEFAULT_API_PORT,
        Some(p) => match p.parse() {
            Ok(port) => port,
            Err(_) => return Parsed::BadPort(p.to_string()),
        },
    };
    Parsed::Run(Args {
        command: arg(1).unwrap_or(DEFAULT_COMMAND).to_string(),
        host: arg(2).unwrap_or(DEFAULT_HOST).to_string(),
        port,
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let prog = argv.first().map(String::as_str).unwrap_or("hashmill-api");
    let args = match parse_args(&argv) {
        Parsed::Run(args) => args,
        Parsed::Help => {
            eprintln!("usage: {prog} [command [ip/host [port]]]");
            return ExitCode::FAILURE;
        }
        Parsed::BadPort(p) => {
            eprintln!("Invalid port '{p}'");
            return ExitCode::FAILURE;
        }
    };

    match api::request(&args.host, args.port, &args.command, TIMEOUT).await {
        Ok(reply) => {
            println!("Reply was '{reply}'");
            print!("{}", api::display(&reply));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
