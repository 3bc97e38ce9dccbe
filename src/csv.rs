use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::{Amount, BalanceView, CreditRequest, UserId};

/// Errors that can occur when reading request rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized request type '{req_type}'")]
    UnrecognizedType { line: usize, req_type: String },

    #[error("line {line}: {req_type} missing amount")]
    MissingAmount { line: usize, req_type: String },

    #[error("line {line}: reward missing reward_id")]
    MissingRewardId { line: usize },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    user: UserId,
    amount: Option<f64>,
    reward_id: Option<String>,
    key: String,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    user: &'a str,
    balance: String,
    ops: usize,
}

/// Read credit requests from a csv file with the header
/// `type,user,amount,reward_id,key`
pub fn read_requests(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<CreditRequest, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let amount = |req_type: &str| {
                row.amount
                    .map(Amount::from_float)
                    .ok_or_else(|| CsvError::MissingAmount {
                        line,
                        req_type: req_type.to_string(),
                    })
            };
            match row.r#type.as_str() {
                "topup" => Ok(CreditRequest::TopUp {
                    amount_usd: amount("topup")?,
                    user: row.user,
                    key: row.key,
                }),
                "reward" => Ok(CreditRequest::Reward {
                    amount_coins: amount("reward")?,
                    reward_id: row
                        .reward_id
                        .filter(|id| !id.is_empty())
                        .ok_or(CsvError::MissingRewardId { line })?,
                    user: row.user,
                    key: row.key,
                }),
                other => Err(CsvError::UnrecognizedType {
                    line,
                    req_type: other.to_string(),
                }),
            }
        }))
}

/// Write account balances to `out` in csv format
pub fn write_balances<'a>(
    out: impl io::Write,
    accounts: impl IntoIterator<Item = (&'a str, &'a BalanceView)>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);

    for (user, view) in accounts {
        writer.serialize(OutputRow {
            user,
            balance: view.balance.to_string(),
            ops: view.recent_ops.len(),
        })?;
    }

    writer.flush()?;
    Ok(())
}
