use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use credit_ledger::csv::{read_requests, write_balances};
use credit_ledger::{Ledger, LedgerConfig};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .init();

    let path = env::args()
        .nth(1)
        .expect("usage: credit-ledger <requests.csv>");

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = match LedgerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let requests = match read_requests(PathBuf::from(&path)) {
        Ok(requests) => requests,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let ledger = Arc::new(Ledger::with_config(config));
    let (req_sender, req_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in requests {
            match result {
                Ok(request) => {
                    if req_sender.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let summary = ledger.run(ReceiverStream::new(req_receiver)).await;
    let stats = ledger.stats();
    info!(
        applied = summary.applied,
        replayed = summary.replayed,
        rejected = summary.rejected,
        users = stats.users,
        keys = stats.idempotency_keys,
        "requests processed"
    );

    let accounts = ledger.accounts();
    let rows = accounts.iter().map(|(user, view)| (user.as_str(), view));
    if let Err(e) = write_balances(io::stdout().lock(), rows) {
        error!("failed to write balances: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
