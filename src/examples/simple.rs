//! Simple example of using reqwest-identity-pool.

use reqwest_middleware::ClientBuilder;
use reqwest_identity_pool::{
    ClientOptions, ClientPool, HttpRequest, IdentityPoolMiddleware, PoolConfig, ProxyDescriptor,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing client pool...");

    let config = PoolConfig::builder()
        .proxies(vec![
            ProxyDescriptor::new("127.0.0.1", 1080),
            ProxyDescriptor::new("127.0.0.1", 1081).with_auth("user", "pass"),
        ])
        .liveness_url("https://httpbin.org/status/200")
        .request_timeout(Duration::from_secs(10))
        .recovery_interval(Duration::from_secs(30))
        // no challenge-protected endpoints are hit here
        .challenge_metadata_interval(None)
        .build();

    let pool = ClientPool::new(config).await?;
    pool.validate_all().await;
    println!("Pool status: {:?}", pool.stats());

    // Direct use of a pooled client.
    let client = pool.acquire(ClientOptions::default())?;
    let response = client.send(HttpRequest::get("https://httpbin.org/ip")).await?;
    println!("Status: {}", response.status);
    println!("Response: {}", response.text());

    // Or behind reqwest-middleware.
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(IdentityPoolMiddleware::from_pool(pool))
        .build();

    println!("Sending request...");
    let response = client.get("https://httpbin.org/ip").send().await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);

    Ok(())
}
