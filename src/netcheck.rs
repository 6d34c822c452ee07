//! Connectivity pre-check and public address lookup.
//!
//! Stack detection never sends probe traffic of its own: the UDP checks
//! only ask the kernel for a route, and the web checks are HEAD requests
//! that accept anything below a server error.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::utils::USER_AGENT;

const IP_INFO_URL: &str = "http://ipinfo.io";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    None,
    V4Only,
    V6Only,
    Dual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackStatus {
    pub has_v4: bool,
    pub has_v6: bool,
}

impl StackStatus {
    pub fn stack(&self) -> Stack {
        match (self.has_v4, self.has_v6) {
            (true, true) => Stack::Dual,
            (true, false) => Stack::V4Only,
            (false, true) => Stack::V6Only,
            (false, false) => Stack::None,
        }
    }

    pub fn connected(&self) -> bool {
        self.has_v4 || self.has_v6
    }
}

/// Probes both address families concurrently. The overall timeout is
/// floored at two seconds and split across the four checks per family.
pub async fn check_stack(timeout: Duration) -> StackStatus {
    let timeout = timeout.max(Duration::from_secs(2));
    let per_check = timeout / 4;
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(per_check)
        .build()
        .ok();

    let (v4_dns_a, v4_dns_b, v4_web_a, v4_web_b, v6_dns_a, v6_dns_b, v6_web_a, v6_web_b) = tokio::join!(
        udp_route("0.0.0.0:0", "223.5.5.5:53", per_check),
        udp_route("0.0.0.0:0", "8.8.8.8:53", per_check),
        head_ok(client.as_ref(), "https://www.baidu.com"),
        head_ok(client.as_ref(), "https://1.1.1.1"),
        udp_route("[::]:0", "[2400:3200::1]:53", per_check),
        udp_route("[::]:0", "[2001:4860:4860::8888]:53", per_check),
        head_ok(client.as_ref(), "https://[2400:3200::1]"),
        head_ok(client.as_ref(), "https://[2606:4700::1111]"),
    );

    let status = StackStatus {
        has_v4: v4_dns_a || v4_dns_b || v4_web_a || v4_web_b,
        has_v6: v6_dns_a || v6_dns_b || v6_web_a || v6_web_b,
    };
    debug!(has_v4 = status.has_v4, has_v6 = status.has_v6, "stack check finished");
    status
}

/// A connected UDP socket proves the kernel has a route; no packet is sent.
async fn udp_route(bind: &str, remote: &str, limit: Duration) -> bool {
    let check = async {
        match tokio::net::UdpSocket::bind(bind).await {
            Ok(socket) => socket.connect(remote).await.is_ok(),
            Err(_) => false,
        }
    };
    tokio::time::timeout(limit, check).await.unwrap_or(false)
}

async fn head_ok(client: Option<&reqwest::Client>, url: &str) -> bool {
    let Some(client) = client else { return false };
    match client.head(url).send().await {
        Ok(response) => response.status().as_u16() < 500,
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpInfo {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub org: String,
}

pub async fn fetch_ip_info(client: &reqwest::Client) -> anyhow::Result<IpInfo> {
    let info = client
        .get(IP_INFO_URL)
        .send()
        .await?
        .error_for_status()?
        .json::<IpInfo>()
        .await?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_maps_from_family_flags() {
        assert_eq!(StackStatus { has_v4: true, has_v6: true }.stack(), Stack::Dual);
        assert_eq!(StackStatus { has_v4: true, has_v6: false }.stack(), Stack::V4Only);
        assert_eq!(StackStatus { has_v4: false, has_v6: true }.stack(), Stack::V6Only);
        assert_eq!(StackStatus { has_v4: false, has_v6: false }.stack(), Stack::None);
    }

    #[test]
    fn connected_needs_either_family() {
        assert!(StackStatus { has_v4: true, has_v6: false }.connected());
        assert!(StackStatus { has_v4: false, has_v6: true }.connected());
        assert!(!StackStatus { has_v4: false, has_v6: false }.connected());
    }

    #[test]
    fn ip_info_ignores_unknown_fields() {
        let raw = r#"{
            "ip": "203.0.113.7",
            "hostname": "example.net",
            "city": "Frankfurt",
            "region": "Hesse",
            "country": "DE",
            "loc": "50.1155,8.6842",
            "org": "AS64500 Example Carrier",
            "postal": "60311",
            "timezone": "Europe/Berlin"
        }"#;
        let info: IpInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.ip, "203.0.113.7");
        assert_eq!(info.org, "AS64500 Example Carrier");
        assert_eq!(info.country, "DE");
    }

    #[test]
    fn ip_info_tolerates_missing_fields() {
        let info: IpInfo = serde_json::from_str(r#"{"ip":"198.51.100.2"}"#).unwrap();
        assert_eq!(info.ip, "198.51.100.2");
        assert!(info.org.is_empty());
    }
}
