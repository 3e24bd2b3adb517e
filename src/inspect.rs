//! Evaluating a per-package predicate over many packages.
//!
//! There is no way to query a flag for all packages at once, so each package costs one device
//! round-trip. [`filter_parallel`] keeps up to [`MAX_IN_FLIGHT`] of them running at a time;
//! [`filter_sequential`] is the fallback that runs them one by one.

use std::{future::Future, sync::Arc};

use log::debug;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::error::{CliError, Result};

/// Upper bound on concurrent predicate evaluations.
pub const MAX_IN_FLIGHT: usize = 50;

/// Evaluates `predicate` for every id and returns the ids it matched, in completion order.
///
/// All evaluations run to completion even if some of them fail; the first error is returned
/// afterwards.
pub async fn filter_parallel<F, Fut>(ids: Vec<String>, predicate: F) -> Result<Vec<String>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<(String, bool)>> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
    let mut tasks = JoinSet::new();
    for id in ids {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(anyhow::Error::from)?;
        let evaluation = predicate(id);
        tasks.spawn(async move {
            let result = evaluation.await;
            drop(permit);
            result
        });
    }

    let mut matches = Vec::new();
    let mut first_error: Option<CliError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(CliError::from).and_then(|r| r) {
            Ok((id, true)) => matches.push(id),
            Ok((id, false)) => debug!("{id} does not match"),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(matches),
    }
}

/// Evaluates `predicate` one id at a time, calling `progress(current, total)` before each.
pub async fn filter_sequential<F, Fut, P>(
    ids: Vec<String>,
    predicate: F,
    mut progress: P,
) -> Result<Vec<String>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<(String, bool)>>,
    P: FnMut(usize, usize),
{
    let total = ids.len();
    let mut matches = Vec::new();
    for (index, id) in ids.into_iter().enumerate() {
        progress(index + 1, total);
        let (id, matched) = predicate(id).await?;
        if matched {
            matches.push(id);
        }
    }
    Ok(matches)
}
