use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "backroute")]
#[command(
    about = "Surveys return routes from this host to Chinese carrier networks and labels the backbone each one rides"
)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Write a debug log to backroute.log in the working directory
    #[arg(long)]
    pub log: bool,

    /// Probe the IPv6 target set as well (needs a routable IPv6 stack)
    #[arg(long)]
    pub ipv6: bool,

    /// Address for the upstream lookup instead of the detected public one
    #[arg(long, value_name = "ADDR")]
    pub ip: Option<String>,

    /// Skip the public address banner
    #[arg(long)]
    pub no_ip_info: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_values() {
        let args = Args::try_parse_from(["backroute"]).unwrap();
        assert!(!args.log);
        assert!(!args.ipv6);
        assert!(args.ip.is_none());
        assert!(!args.no_ip_info);
    }

    #[test]
    fn test_args_custom_values() {
        let args = Args::try_parse_from([
            "backroute",
            "--log",
            "--ipv6",
            "--ip",
            "203.0.113.9",
            "--no-ip-info",
        ])
        .unwrap();

        assert!(args.log);
        assert!(args.ipv6);
        assert_eq!(args.ip.as_deref(), Some("203.0.113.9"));
        assert!(args.no_ip_info);
    }

    #[test]
    fn test_args_reject_unknown_flags() {
        assert!(Args::try_parse_from(["backroute", "--protocol", "udp"]).is_err());
        assert!(Args::try_parse_from(["backroute", "extra-positional"]).is_err());
    }
}
