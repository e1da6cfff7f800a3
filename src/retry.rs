//! Retrying request pipeline.
//!
//! Every wire operation funnels through [`retry_with_hosts`]: pick a host
//! from the class selector, run the attempt, and feed the outcome back as
//! reward or punishment plus a telemetry dot. Retriable errors loop until
//! the budget runs out; terminal errors and cancellation surface
//! immediately.
//!
//! Public SDK operations additionally wrap themselves in [`with_sdk_dot`],
//! which records one `sdk`-kind dot whose success reflects the final
//! outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::dot::{DotKind, Dotter};
use crate::error::ApiError;
use crate::host::HostSelector;

/// Runs `attempt` against hosts picked from `selector`, at most `tries`
/// times.
///
/// Per attempt: success rewards the host and dots an `http` success; failure
/// punishes the host when the error warrants it and dots an `http` record
/// whose success flag is the punish decision's negation. Cancellation is
/// returned unchanged and never dotted.
pub(crate) async fn retry_with_hosts<T, F, Fut>(
    selector: &HostSelector,
    dotter: Option<&Arc<Dotter>>,
    api: &'static str,
    service: &'static str,
    tries: usize,
    mut attempt: F,
) -> Result<T, ApiError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let tries = tries.max(1);
    let mut attempt_index = 0;
    loop {
        let Some(host) = selector.select_host() else {
            return Err(ApiError::NoHost { service });
        };

        let started = Instant::now();
        match attempt(host.clone()).await {
            Ok(value) => {
                selector.reward(&host);
                if let Some(dotter) = dotter {
                    let _ = dotter.dot(DotKind::Http, api, true, started.elapsed());
                }
                return Ok(value);
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                let punished = selector.punish_if_needed(&host, &err);
                if let Some(dotter) = dotter {
                    let _ = dotter.dot(DotKind::Http, api, !punished, started.elapsed());
                    if punished {
                        let _ = dotter.punish();
                    }
                }
                warn!(api, host = %host, attempt = attempt_index, error = %err, "attempt failed");

                attempt_index += 1;
                if err.should_retry() && attempt_index < tries {
                    continue;
                }
                return Err(err);
            }
        }
    }
}

/// Brackets a whole SDK operation with one `sdk`-kind telemetry record.
///
/// Cancellation is passed through without a record.
pub(crate) async fn with_sdk_dot<T, Fut>(
    dotter: Option<&Arc<Dotter>>,
    api: &'static str,
    operation: Fut,
) -> Result<T, ApiError>
where
    Fut: Future<Output = Result<T, ApiError>>,
{
    let started = Instant::now();
    let result = operation.await;
    if let Some(dotter) = dotter {
        let cancelled = matches!(&result, Err(e) if e.is_cancelled());
        if !cancelled {
            let _ = dotter.dot(DotKind::Sdk, api, result.is_ok(), started.elapsed());
        }
    }
    result
}
