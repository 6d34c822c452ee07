//! Maps resolved hop addresses to carrier route labels and renders one
//! colored line per target.
//!
//! IPv4 rules are textual prefix matches, ordered so the more specific
//! carrier blocks win over the broader ones they sit inside. IPv6 rules
//! come from embedded per-ASN prefix lists consulted in the same
//! specific-before-general order.

use std::net::IpAddr;

use crossterm::style::Stylize;

use crate::hops::Hop;
use crate::utils::format::pad_right;

pub const NO_ROUTE_NODES: &str = "no return-route node detected";
pub const NO_KNOWN_ASN: &str = "no known route ASN detected";

const RULES_V4: &[(&[&str], &str)] = &[
    (&["59.43"], "AS4809"),
    (&["202.97"], "AS4134"),
    (&["218.105", "210.51"], "AS9929"),
    (&["219.158"], "AS4837"),
    (
        &[
            "223.120.19",
            "223.120.17",
            "223.120.16",
            "223.120.140",
            "223.120.130",
            "223.120.131",
            "223.120.141",
        ],
        "AS58807",
    ),
    (&["223.118", "223.119", "223.120", "223.121"], "AS58453"),
    (&["69.194", "203.22"], "AS23764"),
];

const PREFIX_SETS_V6: &[(&str, &str)] = &[
    ("AS4809", include_str!("prefixes/as4809.txt")),
    ("AS9929", include_str!("prefixes/as9929.txt")),
    ("AS58807", include_str!("prefixes/as58807.txt")),
    ("AS23764", include_str!("prefixes/as23764.txt")),
    ("AS4134", include_str!("prefixes/as4134.txt")),
    ("AS4837", include_str!("prefixes/as4837.txt")),
    ("AS9808", include_str!("prefixes/as9808.txt")),
    ("AS58453", include_str!("prefixes/as58453.txt")),
];

/// Display text per label, aligned so the tier tag starts in the same
/// column everywhere.
fn description(label: &str) -> Option<&'static str> {
    Some(match label {
        "AS23764" => "Telecom CTGNET [premium]",
        "AS4809a" => "Telecom CN2GIA [premium]",
        "AS4809b" => "Telecom CN2GT  [quality]",
        "AS4809" => "Telecom CN2    [quality]",
        "AS4134" => "Telecom 163    [ordinary]",
        "AS9929" => "Unicom 9929    [quality]",
        "AS4837" => "Unicom 4837    [ordinary]",
        "AS58807" => "Mobile CMIN2   [premium]",
        "AS9808" => "Mobile CMI     [ordinary]",
        "AS58453" => "Mobile CMI     [ordinary]",
        _ => return None,
    })
}

/// Zero-or-one label per address; unknown networks stay unlabeled.
pub fn label_for_ip(ip: &IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => label_v4(&v4.to_string()),
        IpAddr::V6(v6) => label_v6(&v6.to_string()),
    }
}

fn label_v4(text: &str) -> Option<&'static str> {
    RULES_V4.iter().find_map(|(prefixes, asn)| {
        prefixes
            .iter()
            .any(|prefix| text.starts_with(prefix))
            .then_some(*asn)
    })
}

fn label_v6(text: &str) -> Option<&'static str> {
    let text = text.to_lowercase();
    PREFIX_SETS_V6.iter().find_map(|(asn, data)| {
        data.lines()
            .map(str::trim)
            .filter(|prefix| !prefix.is_empty())
            .any(|prefix| text.starts_with(prefix))
            .then_some(*asn)
    })
}

/// Every label observed across the merged hop table, in first-seen order.
pub fn extract_labels(hops: &[Hop]) -> Vec<&'static str> {
    hops.iter()
        .flat_map(|hop| hop.nodes.iter())
        .filter_map(|node| label_for_ip(&node.ip))
        .collect()
}

pub fn dedupe(labels: Vec<&'static str>) -> Vec<&'static str> {
    let mut seen = Vec::new();
    for label in labels {
        if !seen.contains(&label) {
            seen.push(label);
        }
    }
    seen
}

/// The premium backbone label splits on co-occurrence with the 163
/// backbone: both present means groomed transit (GT), the premium label
/// alone means improved access (GIA), anything else passes through.
pub fn disambiguate(mut labels: Vec<&'static str>) -> Vec<&'static str> {
    let has_163 = labels.contains(&"AS4134");
    let has_premium = labels.contains(&"AS4809");
    if has_163 && has_premium {
        labels.insert(0, "AS4809b");
    } else if has_premium {
        labels.insert(0, "AS4809a");
    }
    labels
}

fn paint(label: &str, text: &str) -> String {
    match label {
        "AS9929" | "AS4809a" | "AS23764" => text.dark_green().to_string(),
        "AS4809b" | "AS58807" => text.green().to_string(),
        _ => text.white().to_string(),
    }
}

fn pad_ip(ip: &str) -> String {
    let width = if ip.contains(':') { 40 } else { 24 };
    pad_right(ip, width)
}

/// One output line: target name, padded address, then a colored token per
/// surviving label. The raw premium label never renders (its a/b variants
/// replace it) and repeated description texts render once.
pub fn render_route(name: &str, ip: &str, labels: &[&str]) -> String {
    let mut line = format!("{} {} ", name, pad_ip(ip));
    let mut rendered: Vec<&str> = Vec::new();
    for &label in labels {
        if label == "AS4809" {
            continue;
        }
        let Some(text) = description(label) else {
            continue;
        };
        if rendered.contains(&text) {
            continue;
        }
        rendered.push(text);
        line.push_str(&paint(label, text));
        line.push(' ');
    }
    if rendered.is_empty() {
        line.push_str(&NO_KNOWN_ASN.red().to_string());
    }
    line
}

pub fn failure_line(name: &str, ip: &str, reason: &str) -> String {
    format!("{} {} {}", name, pad_ip(ip), reason.red())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(text: &str) -> IpAddr {
        IpAddr::V4(text.parse::<Ipv4Addr>().unwrap())
    }

    fn v6(text: &str) -> IpAddr {
        IpAddr::V6(text.parse::<Ipv6Addr>().unwrap())
    }

    #[test]
    fn v4_prefixes_map_to_carriers() {
        assert_eq!(label_for_ip(&v4("59.43.80.1")), Some("AS4809"));
        assert_eq!(label_for_ip(&v4("202.97.12.1")), Some("AS4134"));
        assert_eq!(label_for_ip(&v4("218.105.2.3")), Some("AS9929"));
        assert_eq!(label_for_ip(&v4("210.51.160.1")), Some("AS9929"));
        assert_eq!(label_for_ip(&v4("219.158.5.150")), Some("AS4837"));
        assert_eq!(label_for_ip(&v4("69.194.1.1")), Some("AS23764"));
        assert_eq!(label_for_ip(&v4("8.8.8.8")), None);
    }

    #[test]
    fn premium_mobile_blocks_win_over_the_general_range() {
        assert_eq!(label_for_ip(&v4("223.120.19.5")), Some("AS58807"));
        assert_eq!(label_for_ip(&v4("223.120.140.9")), Some("AS58807"));
        // Same /16, outside the premium sub-blocks.
        assert_eq!(label_for_ip(&v4("223.120.8.1")), Some("AS58453"));
        assert_eq!(label_for_ip(&v4("223.121.30.1")), Some("AS58453"));
    }

    #[test]
    fn v6_specific_carrier_lists_are_consulted_first() {
        // Inside the CN2 block, which sits inside the Telecom range.
        assert_eq!(label_for_ip(&v6("240e:ff00::1")), Some("AS4809"));
        assert_eq!(label_for_ip(&v6("240e:97c:2f::1")), Some("AS4134"));
        assert_eq!(label_for_ip(&v6("2408:8000:9000::2")), Some("AS9929"));
        assert_eq!(label_for_ip(&v6("2408:8756:f50::1")), Some("AS4837"));
        assert_eq!(label_for_ip(&v6("2409:8089:1::1")), Some("AS58807"));
        assert_eq!(label_for_ip(&v6("2409:8c00::1")), Some("AS9808"));
        assert_eq!(label_for_ip(&v6("2400:da00::5")), Some("AS23764"));
        assert_eq!(label_for_ip(&v6("2001:db8::1")), None);
    }

    #[test]
    fn premium_alone_rewrites_to_gia() {
        let labels = disambiguate(vec!["AS4809"]);
        assert_eq!(labels, vec!["AS4809a", "AS4809"]);

        let line = render_route("Beijing Telecom v4", "219.141.140.10", &labels);
        assert!(line.contains("Telecom CN2GIA [premium]"));
        assert!(!line.contains("Telecom CN2GT"));
        assert!(!line.contains("Telecom CN2    "));
    }

    #[test]
    fn premium_with_163_rewrites_to_gt() {
        let labels = disambiguate(vec!["AS4134", "AS4809"]);
        assert_eq!(labels[0], "AS4809b");

        let line = render_route("Shanghai Telecom v4", "202.96.209.133", &labels);
        assert!(line.contains("Telecom CN2GT  [quality]"));
        assert!(!line.contains("CN2GIA"));
        assert!(line.contains("Telecom 163    [ordinary]"));
    }

    #[test]
    fn labels_without_premium_pass_through_unchanged() {
        assert_eq!(disambiguate(vec!["AS4134"]), vec!["AS4134"]);
        assert_eq!(disambiguate(Vec::new()), Vec::<&str>::new());
    }

    #[test]
    fn duplicate_description_texts_render_once() {
        // Both CMI labels share one description.
        let line = render_route("Beijing Mobile v4", "221.179.155.161", &["AS9808", "AS58453"]);
        assert_eq!(line.matches("Mobile CMI     [ordinary]").count(), 1);
    }

    #[test]
    fn no_surviving_label_renders_the_sentinel() {
        let line = render_route("Chengdu Unicom v4", "119.6.6.6", &[]);
        assert!(line.contains(NO_KNOWN_ASN));

        // The raw premium label alone (no rewrite applied) renders nothing.
        let line = render_route("Chengdu Unicom v4", "119.6.6.6", &["AS4809"]);
        assert!(line.contains(NO_KNOWN_ASN));
    }

    #[test]
    fn extraction_keeps_first_observation_order() {
        use crate::hops::Node;
        use std::time::Duration;

        let hops = vec![
            Hop {
                distance: 1,
                nodes: vec![Node { ip: v4("202.97.1.1"), rtt: vec![Duration::from_millis(1)] }],
            },
            Hop {
                distance: 2,
                nodes: vec![
                    Node { ip: v4("59.43.1.1"), rtt: vec![Duration::from_millis(2)] },
                    Node { ip: v4("202.97.2.2"), rtt: vec![Duration::from_millis(2)] },
                ],
            },
        ];

        let labels = dedupe(extract_labels(&hops));
        assert_eq!(labels, vec!["AS4134", "AS4809"]);
    }

    #[test]
    fn address_field_width_depends_on_family() {
        let v4_line = render_route("a", "1.2.3.4", &[]);
        assert!(v4_line.starts_with(&format!("a {:<24} ", "1.2.3.4")));

        let v6_line = render_route("a", "240e:ff00::1", &[]);
        assert!(v6_line.starts_with(&format!("a {:<40} ", "240e:ff00::1")));
    }
}
