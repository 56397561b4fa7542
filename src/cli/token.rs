//! CLI `token` command: fetch an anti-forgery token through the session cache.

use std::sync::Arc;

use anyhow::Result;

use sluice::client::csrf::CsrfTokenCache;
use sluice::client::transport::HttpTransport;
use sluice::config::SluiceConfig;

pub async fn token(config: &SluiceConfig) -> Result<()> {
    let transport = Arc::new(HttpTransport::new(&config.client)?);
    let store = sluice::client::create_token_store(config)?;
    let cache = CsrfTokenCache::new(transport, store, config.client.token_refresh_margin());

    let token = cache.get_token().await?;
    let source = if cache.fetch_count() == 0 { "cached" } else { "fetched" };
    println!("{}", token.value);
    eprintln!("expires {} ({source})", token.expiry.to_rfc3339());
    Ok(())
}
