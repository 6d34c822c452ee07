//! Built-in probe targets and the remote feed of alternative addresses.
//!
//! The feed ships as concatenated JSON objects on a handful of mirrors;
//! entries carry Chinese province and carrier names, so each built-in
//! target keeps the tokens the feed matches on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const FEED_URL: &str = "https://raw.githubusercontent.com/spiritLHLS/icmp_targets/main/nodes.json";

const CDN_MIRRORS: &[&str] = &[
    "http://cdn1.spiritlhl.net/",
    "http://cdn2.spiritlhl.net/",
    "http://cdn3.spiritlhl.net/",
    "http://cdn4.spiritlhl.net/",
];

const FEED_TTL: Duration = Duration::from_secs(60 * 60);
const FEED_TIMEOUT: Duration = Duration::from_secs(6);
const ALTERNATIVES_MAX: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub name: &'static str,
    pub ip: &'static str,
    pub province: &'static str,
    pub isp: &'static str,
}

impl Target {
    pub fn version(&self) -> &'static str {
        if self.ip.contains(':') {
            "v6"
        } else {
            "v4"
        }
    }
}

pub static TARGETS_V4: [Target; 12] = [
    Target { name: "Beijing Telecom v4", ip: "219.141.140.10", province: "北京", isp: "电信" },
    Target { name: "Beijing Unicom v4", ip: "202.106.195.68", province: "北京", isp: "联通" },
    Target { name: "Beijing Mobile v4", ip: "221.179.155.161", province: "北京", isp: "移动" },
    Target { name: "Shanghai Telecom v4", ip: "202.96.209.133", province: "上海", isp: "电信" },
    Target { name: "Shanghai Unicom v4", ip: "210.22.97.1", province: "上海", isp: "联通" },
    Target { name: "Shanghai Mobile v4", ip: "211.136.112.200", province: "上海", isp: "移动" },
    Target { name: "Guangzhou Telecom v4", ip: "58.60.188.222", province: "广东", isp: "电信" },
    Target { name: "Guangzhou Unicom v4", ip: "210.21.196.6", province: "广东", isp: "联通" },
    Target { name: "Guangzhou Mobile v4", ip: "120.196.165.24", province: "广东", isp: "移动" },
    Target { name: "Chengdu Telecom v4", ip: "61.139.2.69", province: "四川", isp: "电信" },
    Target { name: "Chengdu Unicom v4", ip: "119.6.6.6", province: "四川", isp: "联通" },
    Target { name: "Chengdu Mobile v4", ip: "211.137.96.205", province: "四川", isp: "移动" },
];

pub static TARGETS_V6: [Target; 9] = [
    Target { name: "Beijing Telecom v6", ip: "2400:89c0:1053:3::69", province: "北京", isp: "电信" },
    Target { name: "Beijing Unicom v6", ip: "2400:89c0:1013:3::54", province: "北京", isp: "联通" },
    Target { name: "Beijing Mobile v6", ip: "2409:8c00:8421:1303::55", province: "北京", isp: "移动" },
    Target { name: "Shanghai Telecom v6", ip: "240e:e1:aa00:4000::24", province: "上海", isp: "电信" },
    Target { name: "Shanghai Unicom v6", ip: "2408:80f1:21:5003::a", province: "上海", isp: "联通" },
    Target { name: "Shanghai Mobile v6", ip: "2409:8c1e:75b0:3003::26", province: "上海", isp: "移动" },
    Target { name: "Guangzhou Telecom v6", ip: "240e:97c:2f:3000::44", province: "广东", isp: "电信" },
    Target { name: "Guangzhou Unicom v6", ip: "2408:8756:f50:1001::c", province: "广东", isp: "联通" },
    Target { name: "Guangzhou Mobile v6", ip: "2409:8c54:871:1001::12", province: "广东", isp: "移动" },
];

/// Probe set for one run, IPv4 first.
pub fn selected(use_ipv6: bool) -> Vec<&'static Target> {
    let mut targets: Vec<&'static Target> = TARGETS_V4.iter().collect();
    if use_ipv6 {
        targets.extend(TARGETS_V6.iter());
    }
    targets
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedTarget {
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub isp: String,
    #[serde(default)]
    pub ip_version: String,
    #[serde(default)]
    pub ips: String,
}

struct CacheEntry {
    fetched: Instant,
    targets: Arc<Vec<FeedTarget>>,
}

/// Hour-cached view of the remote feed. A failed fetch caches an empty
/// list so a dead network does not retry per target.
pub struct RemoteFeed {
    client: reqwest::Client,
    cache: Mutex<Option<CacheEntry>>,
}

impl RemoteFeed {
    pub fn new(client: reqwest::Client) -> Self {
        RemoteFeed { client, cache: Mutex::new(None) }
    }

    /// Up to three alternative addresses for the target's province,
    /// carrier and address family.
    pub async fn alternatives(&self, target: &Target) -> Vec<String> {
        let feed = self.targets().await;
        select_alternatives(&feed, target)
    }

    async fn targets(&self) -> Arc<Vec<FeedTarget>> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref() {
            if entry.fetched.elapsed() < FEED_TTL {
                return Arc::clone(&entry.targets);
            }
        }
        let targets = Arc::new(fetch(&self.client).await);
        *cache = Some(CacheEntry { fetched: Instant::now(), targets: Arc::clone(&targets) });
        targets
    }
}

async fn fetch(client: &reqwest::Client) -> Vec<FeedTarget> {
    for mirror in CDN_MIRRORS {
        let url = format!("{mirror}{FEED_URL}");
        let response = match client.get(&url).timeout(FEED_TIMEOUT).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!("target feed mirror {mirror} failed: {err}");
                continue;
            }
        };
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                debug!("target feed mirror {mirror} body read failed: {err}");
                continue;
            }
        };
        if body.contains("error") {
            continue;
        }
        if let Some(targets) = parse_feed(&body) {
            return targets;
        }
    }
    warn!("target feed unreachable, alternative addresses disabled");
    Vec::new()
}

/// The feed is newline-free concatenated objects, occasionally already a
/// proper array. Normalize to an array before decoding.
fn parse_feed(raw: &str) -> Option<Vec<FeedTarget>> {
    let trimmed = raw.trim();
    let wrapped = if trimmed.starts_with('[') {
        trimmed.to_string()
    } else {
        format!("[{trimmed}]")
    };
    serde_json::from_str(&wrapped.replace("}{", "},{")).ok()
}

fn select_alternatives(feed: &[FeedTarget], target: &Target) -> Vec<String> {
    let version = target.version();
    for entry in feed {
        let province_matches = entry.province == target.province
            || entry.province == format!("{}省", target.province);
        if !province_matches || entry.isp != target.isp || entry.ip_version != version {
            continue;
        }
        return entry
            .ips
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .take(ALTERNATIVES_MAX)
            .collect();
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn builtin_targets_parse_as_their_family() {
        for target in &TARGETS_V4 {
            assert!(target.ip.parse::<Ipv4Addr>().is_ok(), "{}", target.ip);
            assert_eq!(target.version(), "v4");
        }
        for target in &TARGETS_V6 {
            assert!(target.ip.parse::<Ipv6Addr>().is_ok(), "{}", target.ip);
            assert_eq!(target.version(), "v6");
        }
    }

    #[test]
    fn selection_is_v4_first_and_flag_gated() {
        assert_eq!(selected(false).len(), TARGETS_V4.len());
        let all = selected(true);
        assert_eq!(all.len(), TARGETS_V4.len() + TARGETS_V6.len());
        assert_eq!(all[0].name, "Beijing Telecom v4");
        assert_eq!(all[TARGETS_V4.len()].name, "Beijing Telecom v6");
    }

    #[test]
    fn feed_parses_concatenated_objects() {
        let raw = r#"{"province":"北京","isp":"电信","ip_version":"v4","ips":"1.2.3.4"}{"province":"上海","isp":"联通","ip_version":"v4","ips":"5.6.7.8"}"#;
        let feed = parse_feed(raw).unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[1].province, "上海");
    }

    #[test]
    fn feed_parses_a_proper_array_unchanged() {
        let raw = r#"[{"province":"四川省","isp":"移动","ip_version":"v6","ips":"2409::1, 2409::2"}]"#;
        let feed = parse_feed(raw).unwrap();
        assert_eq!(feed.len(), 1);
        assert!(parse_feed("not json").is_none());
    }

    #[test]
    fn alternatives_match_province_with_optional_suffix() {
        let feed = vec![FeedTarget {
            province: "四川省".into(),
            isp: "电信".into(),
            ip_version: "v4".into(),
            ips: "1.1.1.1, 2.2.2.2".into(),
        }];
        let target = &TARGETS_V4[9];
        assert_eq!(target.name, "Chengdu Telecom v4");
        assert_eq!(select_alternatives(&feed, target), vec!["1.1.1.1", "2.2.2.2"]);
    }

    #[test]
    fn alternatives_filter_by_carrier_and_family_and_cap_at_three() {
        let feed = vec![
            FeedTarget {
                province: "北京".into(),
                isp: "联通".into(),
                ip_version: "v4".into(),
                ips: "9.9.9.9".into(),
            },
            FeedTarget {
                province: "北京".into(),
                isp: "电信".into(),
                ip_version: "v6".into(),
                ips: "240e::1".into(),
            },
            FeedTarget {
                province: "北京".into(),
                isp: "电信".into(),
                ip_version: "v4".into(),
                ips: "1.1.1.1,2.2.2.2,3.3.3.3,4.4.4.4".into(),
            },
        ];
        let target = &TARGETS_V4[0];
        let ips = select_alternatives(&feed, target);
        assert_eq!(ips, vec!["1.1.1.1", "2.2.2.2", "3.3.3.3"]);
    }

    #[test]
    fn first_matching_entry_wins() {
        let feed = vec![
            FeedTarget {
                province: "上海".into(),
                isp: "移动".into(),
                ip_version: "v4".into(),
                ips: "7.7.7.7".into(),
            },
            FeedTarget {
                province: "上海".into(),
                isp: "移动".into(),
                ip_version: "v4".into(),
                ips: "8.8.8.8".into(),
            },
        ];
        let target = &TARGETS_V4[5];
        assert_eq!(select_alternatives(&feed, target), vec!["7.7.7.7"]);
    }
}
