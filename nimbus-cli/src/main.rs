mod cli;
mod cmd;
mod names;

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse()?)
                    .add_directive("hyper_util=error".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();

    let args = cli::parse();
    debug!("{args:#?}");

    let client = args.build_client()?;
    info!(endpoint = %args.endpoint, "configuration loaded");

    match args.command {
        Command::Demo {
            shared_secret,
            name,
        } => cmd::demo::run(&client, &shared_secret, name).await,
        Command::Army {
            count,
            shared_secret,
        } => cmd::army::run(&client, count, &shared_secret).await,
        Command::Simulate {
            shared_secret,
            interval_ms,
            rounds,
        } => cmd::simulate::run(&client, &shared_secret, interval_ms, rounds).await,
        Command::DeleteAll => cmd::delete_all::run(&client).await,
    }
}
