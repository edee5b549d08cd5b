//! Print a snapshot of TCP connections.
//!
//! Run with: cargo run -p tcpdiag --example connections [-- --json]
//!
//! Set `RUST_LOG=tcpdiag=debug` to see the per-family request cycle.

use std::time::Duration;

use tcpdiag::{ConnectionRecord, PollConfig, Poller};

fn main() -> tcpdiag::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let json = std::env::args().any(|a| a == "--json");

    let config = PollConfig::new().receive_timeout(Duration::from_secs(5));
    let mut poller = Poller::new(config)?;

    if !json {
        println!(
            "{:<12} {:<22} {:<22} {:>6} {:>10}",
            "STATE", "LOCAL", "REMOTE", "UID", "INODE"
        );
        println!("{}", "-".repeat(76));
    }

    let report = poller.poll_once(&mut |r: &ConnectionRecord| {
        if json {
            match serde_json::to_string(r) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("cannot serialize record: {}", e),
            }
        } else {
            println!(
                "{:<12} {:<22} {:<22} {:>6} {:>10}",
                r.state.name(),
                r.local_addr().to_string(),
                r.remote_addr().to_string(),
                r.uid,
                r.inode
            );
        }
    });

    for outcome in report.outcomes() {
        if let Err(e) = &outcome.result {
            eprintln!("{}: {}", outcome.family, e);
        }
    }

    let summary = report.into_result()?;
    if !json {
        println!();
        println!(
            "{} connections ({} replies skipped)",
            summary.emitted, summary.skipped
        );
    }

    Ok(())
}
