//! Retry and backoff analysis over a captured conversation.
//!
//! A retry is recognized by a heuristic: two consecutive requests whose first
//! sample (or native histogram) carries the same timestamp are taken to be
//! the same batch sent twice. Nothing in the protocol guarantees it, so findings built on it are
//! best effort.

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use serde::Serialize;

use crate::check;
use crate::endpoint::ResponseScript;
use crate::store::CapturedRequest;
use crate::validate::Report;

/// Slack allowed when comparing consecutive backoff gaps, to absorb scheduling
/// jitter between a sender's timer and the endpoint's clock.
pub const BACKOFF_TOLERANCE: Duration = Duration::from_millis(10);

/// What a conforming sender does after a given status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RetryPolicy {
    /// 5xx: the batch must be sent again.
    MustRetry,
    /// 429: retrying is allowed, not required.
    MayRetry,
    /// 2xx and other 4xx: the batch must not be sent again.
    MustNotRetry,
}

impl RetryPolicy {
    pub fn for_status(status: u16) -> Self {
        match status {
            429 => RetryPolicy::MayRetry,
            500..=599 => RetryPolicy::MustRetry,
            _ => RetryPolicy::MustNotRetry,
        }
    }
}

/// True for statuses after which a sender should retry.
pub fn is_retryable(status: u16) -> bool {
    RetryPolicy::for_status(status) != RetryPolicy::MustNotRetry
}

/// True when `next` looks like a resend of `prev`.
pub fn is_retry_of(prev: &CapturedRequest, next: &CapturedRequest) -> bool {
    match (prev.first_timestamp(), next.first_timestamp()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Runs of consecutive requests that carry the same batch, by index. Only runs
/// of two or more are returned.
pub fn retry_chains(requests: &[Arc<CapturedRequest>]) -> Vec<Vec<usize>> {
    let mut chains = Vec::new();
    let mut current: Vec<usize> = Vec::new();

    for (i, request) in requests.iter().enumerate() {
        let continues = current
            .last()
            .map_or(false, |&prev| is_retry_of(&requests[prev], request));
        if !continues {
            if current.len() > 1 {
                chains.push(std::mem::take(&mut current));
            }
            current.clear();
        }
        current.push(i);
    }
    if current.len() > 1 {
        chains.push(current);
    }

    chains
}

/// Gaps between consecutive arrivals of a chain.
pub fn arrival_gaps(requests: &[Arc<CapturedRequest>], chain: &[usize]) -> Vec<Duration> {
    chain
        .iter()
        .tuple_windows()
        .map(|(&a, &b)| {
            requests[b]
                .received
                .saturating_duration_since(requests[a].received)
        })
        .collect()
}

/// Check that each response got the follow-up its status calls for.
///
/// The response to request `i` is script entry `i`. The last request has no
/// follow-up to judge and is skipped.
pub fn check_retry_policy(requests: &[Arc<CapturedRequest>], script: &ResponseScript, report: &mut Report) {
    for (prev, next) in requests.iter().tuple_windows() {
        let Some(entry) = script.get(prev.index) else {
            continue;
        };
        let retried = is_retry_of(prev, next);
        let mut scope = report.request(next.index);

        match RetryPolicy::for_status(entry.status) {
            RetryPolicy::MustRetry => {
                check!(
                    scope,
                    Must,
                    "retry-on-5xx",
                    retried,
                    "request {} got {} but request {} is a new batch",
                    prev.index,
                    entry.status,
                    next.index
                );
            }
            RetryPolicy::MayRetry => {
                check!(
                    scope,
                    May,
                    "retry-on-429",
                    retried,
                    "request {} got 429 and was not retried",
                    prev.index
                );
            }
            RetryPolicy::MustNotRetry => {
                check!(
                    scope,
                    Must,
                    "no-retry",
                    !retried,
                    "request {} got {} but was sent again as request {}",
                    prev.index,
                    entry.status,
                    next.index
                );
            }
        }
    }
}

/// Check that gaps between retries of one batch never shrink.
pub fn check_backoff(requests: &[Arc<CapturedRequest>], report: &mut Report) {
    for chain in retry_chains(requests) {
        let gaps = arrival_gaps(requests, &chain);
        let shrink = gaps
            .iter()
            .tuple_windows()
            .position(|(a, b)| *b + BACKOFF_TOLERANCE < *a);

        // UNWRAP: chains hold at least two indices.
        let first = *chain.first().unwrap();
        check!(
            report.request(first),
            Should,
            "backoff-non-decreasing",
            shrink.is_none(),
            "retry gaps shrink: {gaps:?}"
        );
    }
}
