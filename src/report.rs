//! Runs the full survey: every target walked concurrently under one
//! wall-clock budget, three walks per target merged into a single hop
//! table, then classified and rendered as one line per target.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hops::{self, Hop};
use crate::route;
use crate::targets::{self, RemoteFeed, Target};
use crate::tracer::{Config, TraceError, Tracer};

const ATTEMPTS: usize = 3;
const OVERALL_BUDGET: Duration = Duration::from_secs(10);
const CANCEL_GRACE: Duration = Duration::from_millis(750);

/// Surveys the built-in targets and returns one rendered line per target,
/// IPv4 first, in list order. Targets still running when the budget runs
/// out are cancelled and filled with the no-route line.
pub async fn run(use_ipv6: bool, client: &reqwest::Client) -> Vec<String> {
    let targets = targets::selected(use_ipv6);
    let tracer = Arc::new(Tracer::new(Config::default()));
    let feed = Arc::new(RemoteFeed::new(client.clone()));
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(targets.len());

    for (index, target) in targets.iter().enumerate() {
        let tracer = Arc::clone(&tracer);
        let feed = Arc::clone(&feed);
        let cancel = cancel.clone();
        let target = *target;
        let tx = tx.clone();
        tokio::spawn(async move {
            let line = trace_target(&tracer, &feed, target, &cancel).await;
            let _ = tx.send((index, line)).await;
        });
    }
    drop(tx);

    let mut lines: Vec<Option<String>> = vec![None; targets.len()];
    let mut received = 0;
    let deadline = Instant::now() + OVERALL_BUDGET;
    while received < targets.len() {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((index, line))) => {
                lines[index] = Some(line);
                received += 1;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("survey budget exhausted, cancelling outstanding walks");
                break;
            }
        }
    }
    if received < targets.len() {
        cancel.cancel();
        let grace = Instant::now() + CANCEL_GRACE;
        while received < targets.len() {
            match timeout_at(grace, rx.recv()).await {
                Ok(Some((index, line))) => {
                    lines[index] = Some(line);
                    received += 1;
                }
                _ => break,
            }
        }
    }
    tracer.close();

    fill_missing(lines, &targets)
}

fn fill_missing(lines: Vec<Option<String>>, targets: &[&'static Target]) -> Vec<String> {
    lines
        .into_iter()
        .zip(targets)
        .map(|(line, target)| {
            line.unwrap_or_else(|| {
                route::failure_line(target.name, target.ip, route::NO_ROUTE_NODES)
            })
        })
        .collect()
}

async fn trace_target(
    tracer: &Tracer,
    feed: &RemoteFeed,
    target: &'static Target,
    cancel: &CancellationToken,
) -> String {
    let destination: IpAddr = match target.ip.parse() {
        Ok(ip) => ip,
        Err(_) => return route::failure_line(target.name, target.ip, "unparseable target address"),
    };

    let (merged, last_error) = walk_attempts(tracer, destination, cancel).await;
    if merged.is_empty() {
        if let Some(err) = last_error {
            return route::failure_line(target.name, target.ip, &err.to_string());
        }
    }

    let mut labels = route::dedupe(route::extract_labels(&merged));
    if labels.is_empty() && !cancel.is_cancelled() {
        labels = alternative_labels(tracer, feed, target, cancel).await;
    }
    if labels.is_empty() {
        return route::failure_line(target.name, target.ip, route::NO_ROUTE_NODES);
    }

    let labels = route::disambiguate(labels);
    route::render_route(target.name, target.ip, &labels)
}

/// Serial walks so concurrent probes to one destination cannot claim each
/// other's replies; empty tables are discarded before merging.
async fn walk_attempts(
    tracer: &Tracer,
    destination: IpAddr,
    cancel: &CancellationToken,
) -> (Vec<Hop>, Option<TraceError>) {
    let mut tables = Vec::new();
    let mut last_error = None;
    for _ in 0..ATTEMPTS {
        if cancel.is_cancelled() {
            break;
        }
        match hops::trace_hops(tracer, destination, cancel).await {
            Ok(table) if !table.is_empty() => tables.push(table),
            Ok(_) => {}
            Err(err) => last_error = Some(err),
        }
    }
    (hops::merge(tables), last_error)
}

/// Walks feed-provided addresses for the same province and carrier until
/// one of them yields labels.
async fn alternative_labels(
    tracer: &Tracer,
    feed: &RemoteFeed,
    target: &'static Target,
    cancel: &CancellationToken,
) -> Vec<&'static str> {
    for ip in feed.alternatives(target).await {
        if cancel.is_cancelled() {
            break;
        }
        let Ok(destination) = ip.parse::<IpAddr>() else {
            continue;
        };
        match hops::trace_hops(tracer, destination, cancel).await {
            Ok(table) => {
                let labels = route::dedupe(route::extract_labels(&table));
                if !labels.is_empty() {
                    debug!(
                        target = target.name,
                        alternative = %destination,
                        "alternative address produced labels"
                    );
                    return labels;
                }
            }
            Err(err) => debug!(target = target.name, "alternative walk failed: {err}"),
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hops::Node;
    use crate::targets::TARGETS_V4;

    fn table(entries: &[(usize, &str)]) -> Vec<Hop> {
        entries
            .iter()
            .map(|(distance, ip)| Hop {
                distance: *distance,
                nodes: vec![Node {
                    ip: ip.parse().unwrap(),
                    rtt: vec![Duration::from_millis(5)],
                }],
            })
            .collect()
    }

    #[test]
    fn premium_only_route_classifies_as_gia_end_to_end() {
        let attempt_a = table(&[(1, "192.168.1.1"), (2, "59.43.80.1")]);
        let attempt_b = table(&[(2, "59.43.80.1"), (3, "219.141.140.10")]);

        let merged = hops::merge(vec![attempt_a, attempt_b]);
        let labels = route::dedupe(route::extract_labels(&merged));
        assert_eq!(labels, vec!["AS4809"]);

        let labels = route::disambiguate(labels);
        let line = route::render_route("Beijing Telecom v4", "219.141.140.10", &labels);
        assert!(line.contains("Beijing Telecom v4"));
        assert!(line.contains("Telecom CN2GIA [premium]"));
        assert!(!line.contains("CN2GT"));
        assert!(!line.contains("Telecom 163"));
    }

    #[test]
    fn mixed_backbone_route_classifies_as_gt_end_to_end() {
        let merged = hops::merge(vec![table(&[
            (1, "202.97.10.2"),
            (2, "59.43.80.1"),
            (3, "202.96.209.133"),
        ])]);
        let labels = route::disambiguate(route::dedupe(route::extract_labels(&merged)));
        let line = route::render_route("Shanghai Telecom v4", "202.96.209.133", &labels);
        assert!(line.contains("Telecom CN2GT  [quality]"));
        assert!(!line.contains("CN2GIA"));
    }

    #[test]
    fn every_target_gets_a_line_even_when_unfinished() {
        let targets: Vec<&'static Target> = TARGETS_V4.iter().take(2).collect();
        let lines = fill_missing(vec![Some("done".to_string()), None], &targets);
        assert_eq!(lines[0], "done");
        assert!(lines[1].contains(targets[1].name));
        assert!(lines[1].contains(route::NO_ROUTE_NODES));
    }
}
