//! Hop tables: shaping one walk's reply stream into ordered hops and
//! merging the tables of independent attempts.

use std::net::IpAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::tracer::{Reply, TraceError, Tracer};

/// One responder seen at a given distance, with every RTT sample observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub ip: IpAddr,
    pub rtt: Vec<Duration>,
}

/// All responders observed at one TTL distance, in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub distance: usize,
    pub nodes: Vec<Node>,
}

struct HopSet {
    destination: IpAddr,
    hops: Vec<Hop>,
}

impl HopSet {
    fn new(destination: IpAddr) -> Self {
        Self { destination, hops: Vec::new() }
    }

    /// Replies may land out of distance order; ordering happens in `finish`.
    fn add(&mut self, reply: Reply) {
        let position = self.hops.iter().position(|hop| hop.distance == reply.distance);
        let hop = match position {
            Some(i) => &mut self.hops[i],
            None => {
                self.hops.push(Hop { distance: reply.distance, nodes: Vec::new() });
                let last = self.hops.len() - 1;
                &mut self.hops[last]
            }
        };
        match hop.nodes.iter_mut().find(|node| node.ip == reply.from) {
            Some(node) => node.rtt.push(reply.rtt),
            None => hop.nodes.push(Node { ip: reply.from, rtt: vec![reply.rtt] }),
        }
    }

    fn finish(mut self) -> Vec<Hop> {
        self.hops.sort_by_key(|hop| hop.distance);
        coalesce_destination(&mut self.hops, self.destination);
        self.hops
    }
}

/// Collapses a trailing run of destination-only hops into the earliest one,
/// keeping every RTT sample. Ceiling adjustment mid-walk can record the
/// destination at several distances; only the first is meaningful.
fn coalesce_destination(hops: &mut Vec<Hop>, destination: IpAddr) {
    let only_destination = |hop: &Hop| hop.nodes.len() == 1 && hop.nodes[0].ip == destination;

    match hops.last() {
        Some(last) if only_destination(last) => {}
        _ => return,
    }
    let Some(boundary) = hops.iter().rposition(|hop| !only_destination(hop)) else {
        return;
    };
    let keep = boundary + 1;
    if keep + 1 >= hops.len() {
        return;
    }

    let folded: Vec<Duration> = hops
        .drain(keep + 1..)
        .flat_map(|hop| {
            hop.nodes
                .into_iter()
                .next()
                .map(|node| node.rtt)
                .unwrap_or_default()
        })
        .collect();
    if let Some(node) = hops[keep].nodes.first_mut() {
        node.rtt.extend(folded);
    }
}

/// Merges per-attempt hop tables into one: hops match by distance, nodes
/// within a hop match by IP, RTT sample lists concatenate.
pub fn merge(attempts: Vec<Vec<Hop>>) -> Vec<Hop> {
    let mut merged: Vec<Hop> = Vec::new();
    for attempt in attempts {
        for hop in attempt {
            match merged.iter_mut().find(|existing| existing.distance == hop.distance) {
                Some(existing) => {
                    for node in hop.nodes {
                        match existing.nodes.iter_mut().find(|known| known.ip == node.ip) {
                            Some(known) => known.rtt.extend(node.rtt),
                            None => existing.nodes.push(node),
                        }
                    }
                }
                None => merged.push(hop),
            }
        }
    }
    merged.sort_by_key(|hop| hop.distance);
    merged
}

/// Runs one TTL walk and shapes its replies into an ordered hop table.
/// An empty table is a normal outcome, not an error.
pub async fn trace_hops(
    tracer: &Tracer,
    destination: IpAddr,
    cancel: &CancellationToken,
) -> Result<Vec<Hop>, TraceError> {
    let mut set = HopSet::new(destination);
    tracer
        .trace(destination, cancel, |reply| set.add(reply))
        .await?;
    Ok(set.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const DESTINATION: IpAddr = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn reply(from: IpAddr, distance: usize, rtt_ms: u64) -> Reply {
        Reply { from, distance, rtt: Duration::from_millis(rtt_ms) }
    }

    fn hop(distance: usize, ips: &[IpAddr]) -> Hop {
        Hop {
            distance,
            nodes: ips
                .iter()
                .map(|&ip| Node { ip, rtt: vec![Duration::from_millis(1)] })
                .collect(),
        }
    }

    #[test]
    fn one_reply_per_ttl_gives_one_hop_per_distance() {
        let mut set = HopSet::new(DESTINATION);
        set.add(reply(ip(1), 1, 5));
        set.add(reply(ip(2), 2, 10));
        set.add(reply(ip(3), 3, 15));

        let hops = set.finish();
        assert_eq!(hops.len(), 3);
        for (index, hop) in hops.iter().enumerate() {
            assert_eq!(hop.distance, index + 1);
            assert_eq!(hop.nodes.len(), 1);
        }
    }

    #[test]
    fn repeat_responder_accumulates_rtt_samples() {
        let mut set = HopSet::new(DESTINATION);
        set.add(reply(ip(1), 1, 5));
        set.add(reply(ip(1), 1, 7));

        let hops = set.finish();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].nodes.len(), 1);
        assert_eq!(hops[0].nodes[0].rtt.len(), 2);
    }

    #[test]
    fn out_of_order_replies_sort_by_distance() {
        let mut set = HopSet::new(DESTINATION);
        set.add(reply(ip(3), 3, 1));
        set.add(reply(ip(1), 1, 1));
        set.add(reply(ip(2), 2, 1));

        let distances: Vec<usize> = set.finish().iter().map(|hop| hop.distance).collect();
        assert_eq!(distances, vec![1, 2, 3]);
    }

    #[test]
    fn trailing_destination_hops_fold_into_the_earliest() {
        let mut set = HopSet::new(DESTINATION);
        set.add(reply(ip(1), 1, 1));
        set.add(reply(DESTINATION, 2, 20));
        set.add(reply(DESTINATION, 3, 30));

        let hops = set.finish();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[1].distance, 2);
        assert_eq!(hops[1].nodes[0].ip, DESTINATION);
        assert_eq!(
            hops[1].nodes[0].rtt,
            vec![Duration::from_millis(20), Duration::from_millis(30)]
        );
    }

    #[test]
    fn single_destination_tail_stays_put() {
        let mut set = HopSet::new(DESTINATION);
        set.add(reply(ip(1), 1, 1));
        set.add(reply(DESTINATION, 2, 20));

        assert_eq!(set.finish().len(), 2);
    }

    #[test]
    fn shared_final_hop_is_not_coalesced() {
        let mut set = HopSet::new(DESTINATION);
        set.add(reply(ip(1), 1, 1));
        set.add(reply(DESTINATION, 2, 20));
        set.add(reply(DESTINATION, 3, 30));
        set.add(reply(ip(2), 3, 31));

        assert_eq!(set.finish().len(), 3);
    }

    #[test]
    fn all_destination_table_is_left_alone() {
        let mut set = HopSet::new(DESTINATION);
        set.add(reply(DESTINATION, 1, 1));
        set.add(reply(DESTINATION, 2, 2));

        assert_eq!(set.finish().len(), 2);
    }

    #[test]
    fn merge_joins_nodes_at_matching_distances() {
        let a = vec![hop(1, &[ip(1)]), hop(2, &[ip(2)]), hop(3, &[DESTINATION])];
        let b = vec![hop(1, &[ip(1)]), hop(2, &[ip(22)])];

        let merged = merge(vec![a, b]);
        assert_eq!(merged.len(), 3);

        let second = &merged[1];
        assert_eq!(second.distance, 2);
        let ips: Vec<IpAddr> = second.nodes.iter().map(|node| node.ip).collect();
        assert_eq!(ips, vec![ip(2), ip(22)]);
    }

    #[test]
    fn merging_an_attempt_with_itself_doubles_samples_only() {
        let attempt = vec![hop(1, &[ip(1)]), hop(2, &[ip(2), ip(3)])];

        let merged = merge(vec![attempt.clone(), attempt.clone()]);
        assert_eq!(merged.len(), attempt.len());
        for (merged_hop, original_hop) in merged.iter().zip(&attempt) {
            assert_eq!(merged_hop.nodes.len(), original_hop.nodes.len());
            for (merged_node, original_node) in merged_hop.nodes.iter().zip(&original_hop.nodes) {
                assert_eq!(merged_node.ip, original_node.ip);
                assert_eq!(merged_node.rtt.len(), 2 * original_node.rtt.len());
            }
        }
    }

    #[test]
    fn merge_of_nothing_is_empty() {
        assert!(merge(Vec::new()).is_empty());
        assert!(merge(vec![Vec::new(), Vec::new()]).is_empty());
    }
}
