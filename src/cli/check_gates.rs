//! CLI `check-gates` command: print the security gate chain and validate it.

use std::sync::Arc;

use anyhow::Result;

use sluice::config::SluiceConfig;
use sluice::gate::forgery::CsrfSigner;
use sluice::gate::pipeline::GatePipeline;
use sluice::gate::rate::RateLimiter;
use sluice::gate::GateKind;

pub fn check_gates(config: &SluiceConfig) -> Result<()> {
    let signer = Arc::new(CsrfSigner::from_config(&config.security)?);
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
    let pipeline = GatePipeline::standard(config, signer, limiter);

    println!("Sluice Gate Report");
    println!("==================");
    println!();
    for (i, kind) in pipeline.kinds().iter().enumerate() {
        println!("  {}. {:<16} {}", i + 1, kind.as_str(), describe(*kind, config));
    }
    println!();

    match pipeline.validate_order() {
        Ok(()) => {
            println!("Order check:       PASSED");
            Ok(())
        }
        Err(violation) => {
            println!("Order check:       FAILED ({violation})");
            anyhow::bail!("security gate order invalid: {violation}")
        }
    }
}

fn describe(kind: GateKind, config: &SluiceConfig) -> String {
    let security = &config.security;
    let rate = &config.rate_limit;
    match kind {
        GateKind::OriginPolicy => format!("allow {}", security.allowed_origins.join(", ")),
        GateKind::SizeLimit => format!("max {}", format_bytes(security.max_body_bytes)),
        GateKind::RateLimit => format!(
            "chat {}/{}s, general {}/{}s",
            rate.chat_max_requests, rate.window_secs, rate.general_max_requests, rate.window_secs
        ),
        GateKind::ForgeryCheck => format!(
            "ttl {}s, exempt {}{}",
            security.token_ttl_secs,
            security.exempt_paths.join(", "),
            if security.csrf_secret.is_some() {
                ""
            } else {
                " (ephemeral secret)"
            }
        ),
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
