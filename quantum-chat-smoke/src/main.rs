#![forbid(unsafe_code)]

use std::process::ExitCode;

use argh::FromArgs;
use log::LevelFilter;
use quantum_chat_proto::msg::ChatContent;
use simple_logger::SimpleLogger;

use crate::check::Target;

mod check;
mod health;
mod net;
mod suite;

const DEFAULT_URL: &str = "ws://localhost/ws";

#[derive(FromArgs, Debug)]
#[argh(description = "Smoke tests for a running Quantum Chat server.")]
struct SmokeArgs {
    #[argh(
        switch,
        short = '6',
        description = "prefer IPv6 when resolving the server address"
    )]
    prefer_ipv6: bool,
    #[argh(subcommand)]
    command: SmokeCommand,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum SmokeCommand {
    Check(CheckArgs),
    Suite(SuiteArgs),
    Health(HealthArgs),
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "check",
    description = "send one chat message and print the answer"
)]
struct CheckArgs {
    #[argh(positional, description = "JWT access token")]
    token: String,
    #[argh(
        option,
        default = "DEFAULT_URL.to_owned()",
        description = "websocket endpoint"
    )]
    url: String,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "suite",
    description = "run the websocket test suite"
)]
struct SuiteArgs {
    #[argh(positional, description = "JWT access token")]
    token: String,
    #[argh(
        option,
        default = "DEFAULT_URL.to_owned()",
        description = "websocket endpoint"
    )]
    url: String,
    #[argh(switch, description = "enable debug logging")]
    debug: bool,
    #[argh(switch, description = "exit with 1 when any test fails")]
    strict: bool,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "health",
    description = "probe the liveness endpoints"
)]
struct HealthArgs {
    #[argh(
        option,
        short = 'a',
        default = "\"localhost:8080\".to_owned()",
        description = "server address to probe"
    )]
    addr: String,
    #[argh(switch, short = 't', description = "use https instead of http")]
    tls: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args: SmokeArgs = argh::from_env();

    let level = match &args.command {
        SmokeCommand::Check(_) => LevelFilter::Debug,
        SmokeCommand::Suite(s) if s.debug => LevelFilter::Debug,
        SmokeCommand::Suite(_) | SmokeCommand::Health(_) => LevelFilter::Info,
    };
    if let Err(e) = SimpleLogger::new()
        .with_level(level)
        .with_module_level("tungstenite", LevelFilter::Info)
        .with_module_level("tokio_tungstenite", LevelFilter::Info)
        .env()
        .init()
    {
        eprintln!("failed to initialize logger: {e}");
        return ExitCode::FAILURE;
    }
    log::debug!("smoke arguments: {args:#?}");

    match args.command {
        SmokeCommand::Check(CheckArgs { token, url }) => {
            let target = Target {
                url,
                token,
                prefer_ipv6: args.prefer_ipv6,
            };
            let hello = ChatContent {
                text: "Hello!".into(),
                timestamp: None,
            };
            match target.exchange(hello).await {
                Ok(_) => {
                    println!("Test completed successfully!");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    log::error!("Error: {e}");
                    println!("Test failed!");
                    ExitCode::FAILURE
                }
            }
        }
        SmokeCommand::Suite(SuiteArgs {
            token, url, strict, ..
        }) => {
            let target = Target {
                url,
                token,
                prefer_ipv6: args.prefer_ipv6,
            };
            match suite::run(&target).await {
                Ok(summary) if strict && !summary.all_passed() => ExitCode::FAILURE,
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    println!("\x1b[31mTest suite failed: {e}\x1b[0m");
                    ExitCode::FAILURE
                }
            }
        }
        SmokeCommand::Health(HealthArgs { addr, tls }) => {
            let base = format!("{}://{addr}", if tls { "https" } else { "http" });
            if health::check(&base, args.prefer_ipv6).await {
                println!("Server is healthy");
                ExitCode::SUCCESS
            } else {
                println!("Server is unhealthy");
                ExitCode::FAILURE
            }
        }
    }
}
