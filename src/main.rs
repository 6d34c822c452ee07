use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crossterm::style::Stylize;
use tracing::{debug, info};

use backroute::args::Args;
use backroute::netcheck::{self, Stack};
use backroute::utils::USER_AGENT;
use backroute::{bgp, report};

const REPO_URL: &str = "https://github.com/backroute/backroute";
const PRECHECK_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const BGP_TRIES: usize = 2;
const BGP_RETRY_PAUSE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.log {
        // Logging is opt-in and goes to a file so stdout stays a clean report.
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open("backroute.log")
        {
            Ok(log_file) => {
                tracing_subscriber::fmt()
                    .with_env_filter("backroute=debug")
                    .with_writer(log_file)
                    .with_ansi(false)
                    .init();
                info!("starting backroute v{}", env!("CARGO_PKG_VERSION"));
            }
            Err(err) => eprintln!("cannot open backroute.log: {err}"),
        }
    }

    println!("{} {}", "Repo:".green(), REPO_URL.yellow());
    println!(
        "{} {}",
        "Start:".green(),
        chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .white()
    );

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()?;

    let mut public_ip = String::new();
    if !args.no_ip_info {
        match netcheck::fetch_ip_info(&client).await {
            Ok(info) => {
                println!(
                    "{}{}{}{}{}{}",
                    "Country: ".green(),
                    info.country.as_str().white(),
                    " City: ".green(),
                    info.city.as_str().white(),
                    " Provider: ".green(),
                    info.org.as_str().blue()
                );
                public_ip = info.ip;
            }
            Err(err) => println!("public address lookup failed: {err}"),
        }
    }

    let status = netcheck::check_stack(PRECHECK_TIMEOUT).await;
    if !status.connected() {
        println!("{}", "connectivity pre-check failed".red());
        return Ok(());
    }
    let use_ipv6 = match status.stack() {
        Stack::Dual => args.ipv6,
        Stack::V6Only => true,
        Stack::V4Only | Stack::None => false,
    };
    debug!(use_ipv6, "probe families decided");

    let lookup_ip = args
        .ip
        .clone()
        .filter(|ip| !ip.is_empty())
        .or_else(|| (!public_ip.is_empty()).then(|| public_ip.clone()));

    let upstream_block = async {
        let ip = lookup_ip?;
        for attempt in 0..BGP_TRIES {
            match bgp::lookup(&client, &ip).await {
                Ok(block) if !block.is_empty() => return Some(block),
                Ok(_) => debug!("upstream lookup returned an empty graph"),
                Err(err) => debug!("upstream lookup failed: {err}"),
            }
            if attempt + 1 < BGP_TRIES {
                tokio::time::sleep(BGP_RETRY_PAUSE).await;
            }
        }
        None
    };

    let (upstream_block, lines) = tokio::join!(upstream_block, report::run(use_ipv6, &client));

    if let Some(block) = upstream_block {
        print!("{block}");
    }
    for line in &lines {
        println!("{line}");
    }
    println!(
        "{}",
        "Route tokens are heuristic; verify important paths with a full traceroute.".yellow()
    );
    println!(
        "{}",
        "With several tokens on one line, hops past the aggregation layer may be stale; trust the first token most."
            .yellow()
    );
    Ok(())
}
