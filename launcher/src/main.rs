//! Commonware Launcher CLI

use clap::{Arg, ArgAction, ArgMatches, Command};
use commonware_launcher::{
    aws::commands::{self, Launch, Overrides},
    Error, Outcome, Status,
};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing::error;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Environment variable that enables debug logging
const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

fn name_arg() -> Arg {
    Arg::new("name")
        .long("name")
        .required(true)
        .help("Name of the child stack")
        .value_parser(clap::value_parser!(String))
}

/// Prints an outcome as JSON and returns the matching exit code.
fn report(result: Result<Outcome, Error>) -> ExitCode {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = ?e, "launcher failed");
            Outcome::from_error(&e)
        }
    };
    match serde_json::to_string(&outcome) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!(error = ?e, "failed to serialize outcome");
            return ExitCode::FAILURE;
        }
    }
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn config_path(matches: &ArgMatches) -> &PathBuf {
    matches.get_one::<PathBuf>("config").unwrap()
}

fn name(matches: &ArgMatches) -> &str {
    matches.get_one::<String>("name").unwrap()
}

/// Entrypoint for the Commonware Launcher CLI
#[tokio::main]
async fn main() -> ExitCode {
    // Define application
    let matches = Command::new("launcher")
        .version(crate_version())
        .about("Provision a bootstrapped instance on demand through a child deployment stack.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(commands::LAUNCH_CMD)
                .about("Submit a provisioning request and wait for it to reach a terminal status.")
                .arg(config_arg())
                .arg(
                    Arg::new("inbound-cidr")
                        .long("inbound-cidr")
                        .env("INBOUND_CIDR")
                        .required(true)
                        .help("IPv4 CIDR block allowed to reach the instance over SSH")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("key-pair-name")
                        .long("key-pair-name")
                        .env("KEY_PAIR_NAME")
                        .required(true)
                        .help("Name of the EC2 key pair installed on the instance")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("request-id")
                        .long("request-id")
                        .env("REQUEST_ID")
                        .help("Idempotency key (reuse it to retry the same request). A random id is generated if not provided.")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("template-url")
                        .long("template-url")
                        .env("TEMPLATE_URL")
                        .help("Location of the instance template (overrides the config file)")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("prefix")
                        .long("prefix")
                        .env("STACK_NAME_PREFIX")
                        .help("Child stack name prefix (overrides the config file)")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .help("Seconds to wait for a terminal status (overrides the config file)")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new(commands::STATUS_CMD)
                .about("Poll the status of a deployment.")
                .arg(config_arg())
                .arg(name_arg()),
        )
        .subcommand(
            Command::new(commands::CANCEL_CMD)
                .about("Cancel an in-flight deployment (best-effort).")
                .arg(config_arg())
                .arg(name_arg()),
        )
        .subcommand(
            Command::new(commands::DESTROY_CMD)
                .about("Tear down a deployment.")
                .arg(config_arg())
                .arg(name_arg()),
        )
        .subcommand(
            Command::new(commands::LIST_CMD)
                .about("List local deployments and live stacks under the configured prefix.")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new(commands::PUBLISH_CMD)
                .about("Publish a template or bootstrap artifact to the configured bucket.")
                .arg(config_arg())
                .arg(
                    Arg::new("artifact")
                        .long("artifact")
                        .required(true)
                        .help("Path to the artifact")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new(commands::POLICY_CMD)
                .about("Print the permission boundary as an IAM policy document.")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new(commands::USER_DATA_CMD)
                .about("Render the instance bootstrap commands.")
                .arg(
                    Arg::new("location")
                        .long("location")
                        .required(true)
                        .help("s3:// location of the bootstrap artifact")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("checksum")
                        .long("checksum")
                        .required(true)
                        .help("SHA-256 of the bootstrap artifact")
                        .value_parser(clap::value_parser!(String)),
                ),
        )
        .get_matches();

    // Create logger
    let debug = matches.get_flag(VERBOSE_FLAG)
        || std::env::var(LOG_LEVEL_ENV).is_ok_and(|level| level.eq_ignore_ascii_case("debug"));
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    // Parse subcommands
    match matches.subcommand() {
        Some((commands::LAUNCH_CMD, matches)) => {
            let overrides = Overrides {
                prefix: matches.get_one::<String>("prefix").cloned(),
                template_url: matches.get_one::<String>("template-url").cloned(),
            };
            let launch = Launch {
                inbound_cidr: matches.get_one::<String>("inbound-cidr").unwrap().clone(),
                key_pair_name: matches.get_one::<String>("key-pair-name").unwrap().clone(),
                request_id: matches.get_one::<String>("request-id").cloned(),
                timeout: matches
                    .get_one::<u64>("timeout")
                    .map(|secs| Duration::from_secs(*secs)),
            };
            report(commands::launch(config_path(matches), overrides, launch).await)
        }
        Some((commands::STATUS_CMD, matches)) => {
            report(commands::status(config_path(matches), name(matches)).await)
        }
        Some((commands::CANCEL_CMD, matches)) => {
            report(commands::cancel(config_path(matches), name(matches)).await)
        }
        Some((commands::DESTROY_CMD, matches)) => {
            let result = commands::destroy(config_path(matches), name(matches)).await;
            match result {
                Ok(outcome) => {
                    println!("{}", serde_json::to_string(&outcome).unwrap_or_default());
                    if outcome.status == Status::Destroyed {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(e) => report(Err(e)),
            }
        }
        Some((commands::LIST_CMD, matches)) => {
            if let Err(e) = commands::list(config_path(matches)).await {
                error!(error = ?e, "failed to list deployments");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Some((commands::PUBLISH_CMD, matches)) => {
            let artifact = matches.get_one::<PathBuf>("artifact").unwrap();
            match commands::publish(config_path(matches), artifact).await {
                Ok(reference) => {
                    println!("{}", serde_json::to_string(&reference).unwrap_or_default());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = ?e, "failed to publish artifact");
                    ExitCode::FAILURE
                }
            }
        }
        Some((commands::POLICY_CMD, matches)) => match commands::policy(config_path(matches)) {
            Ok(document) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&document).unwrap_or_default()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = ?e, "failed to render policy");
                ExitCode::FAILURE
            }
        },
        Some((commands::USER_DATA_CMD, matches)) => {
            let location = matches.get_one::<String>("location").unwrap();
            let checksum = matches.get_one::<String>("checksum").unwrap();
            match commands::user_data(location, checksum) {
                Ok(script) => {
                    print!("{script}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = ?e, "failed to render user data");
                    ExitCode::FAILURE
                }
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
            ExitCode::FAILURE
        }
        None => {
            error!("no subcommand provided");
            ExitCode::FAILURE
        }
    }
}
