use dsctl::commands::lifecycle::grace_from_secs;
use dsctl::commands::{handle_restart, handle_start, handle_status, handle_stop, Cli, Commands, Context};
use dsctl::error::DsctlError;
use dsctl::stopper::StopOptions;
use dsctl::supervisor::StartOptions;
use dsctl::utils::logger::init_logger;
use dsctl::utils::ConfigPaths;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let paths = match ConfigPaths::new() {
        Ok(paths) => paths,
        Err(err) => return report_error(err),
    };

    if let Err(err) = init_logger(
        cli.log_level.as_deref(),
        Some(paths.launcher_log_file.clone()),
    ) {
        eprintln!("Failed to initialise logging: {}", err);
    }

    let ctx = match Context::load(paths, cli.config.as_deref()) {
        Ok(ctx) => ctx,
        Err(err) => return report_error(err),
    };

    match main_impl(cli.command, &ctx).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => report_error(err),
    }
}

async fn main_impl(
    command: Commands,
    ctx: &Context<dsctl::service::Systemctl>,
) -> Result<u8, DsctlError> {
    match command {
        Commands::Start {
            mode,
            foreground,
            direct,
            env_vars,
        } => {
            let options = StartOptions {
                mode,
                foreground,
                direct,
                extra_env: env_vars,
            };
            handle_start(ctx, &options).await
        }
        Commands::Stop {
            force,
            grace,
            direct,
        } => {
            let options = StopOptions {
                force,
                grace: grace_from_secs(grace),
                direct,
            };
            handle_stop(ctx, &options).await
        }
        Commands::Status { json } => handle_status(ctx, json),
        Commands::Restart {
            mode,
            foreground,
            direct,
        } => {
            let options = StartOptions {
                mode,
                foreground,
                direct,
                extra_env: Vec::new(),
            };
            handle_restart(ctx, &options).await
        }
    }
}

fn report_error(err: DsctlError) -> ExitCode {
    tracing::debug!(error = ?err, "command failed");
    eprintln!("❌ {}", err.user_message());
    ExitCode::from(err.exit_code())
}
