//! Upstream provider sketch scraped from the bgp.tools connectivity graph.
//!
//! The prefix page embeds its AS path drawing as an SVG; nodes carry the
//! AS number in a `<title>` and the operator name in an `xlink:title`,
//! and the target AS is highlighted in green. Edges point from customer
//! to provider, so walking them away from the target yields the upstream
//! chain.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossterm::style::Stylize;
use rand::random;
use regex::Regex;
use tracing::debug;

use crate::utils::format::center;

const SITE: &str = "https://bgp.tools";
const RETRY_TIMEOUTS: [Duration; 3] = [
    Duration::from_secs(3),
    Duration::from_secs(4),
    Duration::from_secs(5),
];
const RETRY_PAUSE: Duration = Duration::from_secs(1);

const COLUMN: usize = 18;
const PER_ROW: usize = 5;

/// Settlement-free backbones, with the short name shown in the grid.
const TIER1_GLOBAL: &[(u32, &str)] = &[
    (174, "Cogent"),
    (701, "Verizon"),
    (1299, "Arelion"),
    (2914, "NTT"),
    (3257, "GTT"),
    (3320, "DTAG"),
    (3356, "Lumen"),
    (3491, "PCCW"),
    (5511, "Orange"),
    (6453, "TATA"),
    (6461, "Zayo"),
    (6762, "Sparkle"),
    (6830, "Liberty"),
    (7018, "AT&T"),
    (12956, "Telxius"),
];

const TIER1_REGIONAL: &[u32] = &[
    1273, 2497, 4134, 4637, 4809, 4837, 6939, 7473, 9002, 9808, 9929, 23764, 58453, 58807,
];

const TIER2: &[u32] = &[2516, 3462, 4713, 4766, 9318, 9498, 17676, 55836];

const CONTENT_PROVIDERS: &[u32] = &[8075, 13335, 15169, 16509, 20940, 22822, 32934, 54113];

const IXPS: &[u32] = &[6777, 8714, 51706];

#[derive(Debug, Clone, PartialEq, Eq)]
struct AsNode {
    asn: u32,
    name: String,
    fill: String,
    stroke: String,
}

impl AsNode {
    fn is_target(&self) -> bool {
        self.fill == "limegreen" || self.stroke == "limegreen" || self.fill == "green"
    }

    fn is_tier1(&self) -> bool {
        self.fill == "white" && self.stroke == "#005ea5"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AsEdge {
    from: u32,
    to: u32,
}

#[derive(Debug, Clone)]
struct Upstream {
    asn: u32,
    name: String,
    tier: &'static str,
}

struct Graph {
    nodes: Vec<AsNode>,
    edges: Vec<AsEdge>,
}

/// Fetches the connectivity graph for `ip` and renders the upstream grid.
pub async fn lookup(client: &reqwest::Client, ip: &str) -> Result<String> {
    if ip.parse::<IpAddr>().is_err() {
        bail!("invalid address for upstream lookup: {ip}");
    }
    let page = fetch_text(client, &format!("{SITE}/prefix/{ip}#connectivity"))
        .await
        .context("prefix page fetch failed")?;
    let path = Regex::new(r#"<img[^>]+id="pathimg"[^>]+src="([^"]+)""#)?
        .captures(&page)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| anyhow!("no path graph on the prefix page"))?;
    // Cache buster, same shape the site uses for logged-in refreshes.
    let buster = format!("{:032x}", random::<u128>());
    let svg = fetch_text(client, &format!("{SITE}{path}?{buster}&loggedin"))
        .await
        .context("path graph fetch failed")?;

    let graph = Graph::parse(&svg)?;
    if graph.nodes.is_empty() {
        bail!("no AS nodes in the path graph");
    }
    let target = graph
        .target()
        .ok_or_else(|| anyhow!("could not identify the target AS"))?;
    let upstreams = graph.upstreams(target.asn);
    debug!(target = target.asn, upstreams = upstreams.len(), "parsed path graph");
    Ok(render(&upstreams))
}

/// One GET per timeout step; only a 200 with a readable body counts.
async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let mut last_err = anyhow!("no attempts made");
    for (attempt, limit) in RETRY_TIMEOUTS.iter().enumerate() {
        match client.get(url).timeout(*limit).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                match response.text().await {
                    Ok(text) => return Ok(text),
                    Err(err) => {
                        last_err = anyhow!("attempt {} body read failed: {err}", attempt + 1);
                    }
                }
            }
            Ok(response) => {
                last_err = anyhow!("attempt {} got HTTP {}", attempt + 1, response.status());
            }
            Err(err) => {
                last_err = anyhow!("attempt {} failed: {err}", attempt + 1);
            }
        }
        if attempt + 1 < RETRY_TIMEOUTS.len() {
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }
    Err(last_err.context(format!("all {} attempts failed", RETRY_TIMEOUTS.len())))
}

impl Graph {
    fn parse(svg: &str) -> Result<Graph> {
        let svg = unescape(svg)?;
        let node_re = Regex::new(r#"(?s)<g id="node\d+" class="node">(.*?)</g>"#)?;
        let edge_re = Regex::new(r#"(?s)<g id="edge\d+" class="edge">(.*?)</g>"#)?;
        let asn_re = Regex::new(r"<title>AS(\d+)</title>")?;
        let name_re = Regex::new(r#"xlink:title="([^"]+)""#)?;
        let fill_re = Regex::new(r#"<polygon[^>]+fill="([^"]+)""#)?;
        let stroke_re = Regex::new(r#"<polygon[^>]+stroke="([^"]+)""#)?;
        let link_re = Regex::new(r"<title>AS(\d+)->AS(\d+)</title>")?;

        let mut nodes = Vec::new();
        for caps in node_re.captures_iter(&svg) {
            let block = &caps[1];
            let Some(asn) = asn_re
                .captures(block)
                .and_then(|caps| caps[1].parse::<u32>().ok())
            else {
                continue;
            };
            let name = name_re
                .captures(block)
                .map(|caps| caps[1].trim().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let fill = fill_re
                .captures(block)
                .map(|caps| caps[1].to_string())
                .unwrap_or_else(|| "none".to_string());
            let stroke = stroke_re
                .captures(block)
                .map(|caps| caps[1].to_string())
                .unwrap_or_else(|| "none".to_string());
            nodes.push(AsNode { asn, name, fill, stroke });
        }

        let mut edges = Vec::new();
        for caps in edge_re.captures_iter(&svg) {
            if let Some(link) = link_re.captures(&caps[1]) {
                if let (Ok(from), Ok(to)) = (link[1].parse(), link[2].parse()) {
                    edges.push(AsEdge { from, to });
                }
            }
        }
        Ok(Graph { nodes, edges })
    }

    /// The highlighted node, or the first one when nothing is highlighted.
    fn target(&self) -> Option<&AsNode> {
        self.nodes
            .iter()
            .find(|node| node.is_target())
            .or_else(|| self.nodes.first())
    }

    fn node(&self, asn: u32) -> Option<&AsNode> {
        self.nodes.iter().find(|node| node.asn == asn)
    }

    fn next_hops(&self, from: u32) -> Vec<u32> {
        let mut hops = Vec::new();
        for edge in &self.edges {
            if edge.from == from && !hops.contains(&edge.to) {
                hops.push(edge.to);
            }
        }
        hops
    }

    /// Direct upstreams in node order, then the chain beyond them. A lone
    /// direct upstream gets its whole single-path chain listed; with
    /// several, each chain is followed only until it reaches a tier-1
    /// backbone, which is listed and ends that chain.
    fn upstreams(&self, target: u32) -> Vec<Upstream> {
        let direct = self.next_hops(target);
        let mut added: Vec<u32> = Vec::new();
        let mut found: Vec<Upstream> = Vec::new();
        for node in &self.nodes {
            if !direct.contains(&node.asn) || added.contains(&node.asn) {
                continue;
            }
            found.push(Upstream {
                asn: node.asn,
                name: node.name.clone(),
                tier: classify(node.asn, node.is_tier1(), true),
            });
            added.push(node.asn);
        }

        if found.len() == 1 {
            let mut current = found[0].asn;
            let mut walked = vec![current];
            loop {
                let next = self.next_hops(current);
                if next.len() != 1 {
                    break;
                }
                let next = next[0];
                if added.contains(&next) || walked.contains(&next) {
                    break;
                }
                walked.push(next);
                let Some(node) = self.node(next) else { break };
                found.push(Upstream {
                    asn: node.asn,
                    name: node.name.clone(),
                    tier: classify(node.asn, node.is_tier1(), false),
                });
                added.push(next);
                current = next;
            }
        } else if found.len() > 1 {
            let starts: Vec<u32> = found.iter().map(|upstream| upstream.asn).collect();
            for start in starts {
                let mut current = start;
                let mut walked = vec![current];
                loop {
                    let next = self.next_hops(current);
                    if next.len() != 1 {
                        break;
                    }
                    let next = next[0];
                    if added.contains(&next) || walked.contains(&next) {
                        break;
                    }
                    walked.push(next);
                    let Some(node) = self.node(next) else { break };
                    if node.is_tier1() {
                        found.push(Upstream {
                            asn: node.asn,
                            name: node.name.clone(),
                            tier: classify(node.asn, true, false),
                        });
                        added.push(next);
                        break;
                    }
                    current = next;
                }
            }
        }
        found
    }
}

fn classify(asn: u32, tier1: bool, direct: bool) -> &'static str {
    if tier1 && tier1_abbr(asn).is_some() {
        return "Tier1 Global";
    }
    if TIER1_REGIONAL.contains(&asn) {
        return "Tier1 Regional";
    }
    if TIER2.contains(&asn) {
        return "Tier2";
    }
    if CONTENT_PROVIDERS.contains(&asn) {
        return "CDN Provider";
    }
    if IXPS.contains(&asn) {
        return "IXP";
    }
    if direct {
        "Direct"
    } else {
        "Indirect"
    }
}

fn tier1_abbr(asn: u32) -> Option<&'static str> {
    TIER1_GLOBAL
        .iter()
        .find(|(known, _)| *known == asn)
        .map(|(_, abbr)| *abbr)
}

/// Known backbones render their short name; otherwise a long leading
/// token is cut at the first space and anything else passes through.
fn abbreviate(asn: u32, name: &str) -> String {
    if let Some(abbr) = tier1_abbr(asn) {
        return abbr.to_string();
    }
    match name.find(' ') {
        Some(idx) if idx >= COLUMN => name[..idx].to_string(),
        _ => name.trim().to_string(),
    }
}

/// Three lines per batch of five: AS numbers, operator names, tier tags.
fn render(upstreams: &[Upstream]) -> String {
    let mut out = String::new();
    for batch in upstreams.chunks(PER_ROW) {
        let mut asn_row = String::new();
        let mut name_row = String::new();
        let mut tier_row = String::new();
        for upstream in batch {
            asn_row.push_str(&cell(&format!("AS{}", upstream.asn)).white().to_string());
            name_row.push_str(&cell(&abbreviate(upstream.asn, &upstream.name)));
            tier_row.push_str(&cell(upstream.tier).blue().to_string());
        }
        out.push_str(&asn_row);
        out.push('\n');
        out.push_str(&name_row);
        out.push('\n');
        out.push_str(&tier_row);
        out.push('\n');
    }
    out
}

fn cell(text: &str) -> String {
    let truncated: String = text.chars().take(COLUMN).collect();
    center(&truncated, COLUMN)
}

/// Graphviz escapes a handful of entities in its SVG output.
fn unescape(svg: &str) -> Result<String> {
    let numeric = Regex::new(r"&#(?:(\d+)|x([0-9a-fA-F]+));")?;
    let svg = numeric.replace_all(svg, |caps: &regex::Captures<'_>| {
        let value = match (caps.get(1), caps.get(2)) {
            (Some(decimal), _) => decimal.as_str().parse::<u32>().ok(),
            (_, Some(hex)) => u32::from_str_radix(hex.as_str(), 16).ok(),
            _ => None,
        };
        value
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    Ok(svg
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&"))
}
