//! Serves a bookable-products listing through the read-through cache.
//!
//! ```bash
//! CATALOG_UPSTREAM_URL=https://shop.example.com/wp-json/wc/v3 \
//! CATALOG_UPSTREAM_KEY=ck_... CATALOG_UPSTREAM_SECRET=cs_... \
//! RUST_LOG=catalog_readthrough=debug \
//! cargo run --example storefront_listing
//! ```
//!
//! The resource list can be overridden with `CATALOG_RESOURCES_FILE`
//! pointing at a JSON file in the `ResourceConfig` format.

use catalog_readthrough::{
    EndpointCandidate, QueryShape, ReadThrough, ReadThroughConfigBuilder, ResourceConfig,
    ResponseShaper, SortKey, UpstreamConfig,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn default_resources() -> Vec<ResourceConfig> {
    vec![
        ResourceConfig::new(
            "bookable",
            vec![
                EndpointCandidate::new("booking-type", "products").param("type", "booking"),
                EndpointCandidate::new("bookable-type", "products").param("type", "bookable"),
                EndpointCandidate::new("all-published", "products")
                    .param("status", "publish")
                    .paginated(50, 4),
            ],
        )
        .shaper(
            ResponseShaper::default()
                .with_kinds(["booking", "bookable"])
                .sorted_by(SortKey::MenuOrder),
        ),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let upstream = UpstreamConfig::from_env()?;
    let config = ReadThroughConfigBuilder::from_env()?
        .name("storefront")
        .on_circuit_open(|cooldown| {
            eprintln!("catalog upstream is failing; serving cached listings for {cooldown:?}");
        })
        .on_refresh_failed(|kind| eprintln!("background refresh failed ({kind})"))
        .build()?;
    let resources = match std::env::var("CATALOG_RESOURCES_FILE") {
        Ok(file) => ResourceConfig::list_from_json(&std::fs::read_to_string(file)?)?,
        Err(_) => default_resources(),
    };

    let cache = ReadThrough::connect(upstream, config, resources)?;
    let shape = QueryShape::new("bookable");

    for round in 1..=3 {
        match cache.fetch_normalized(&shape, 12).await {
            Ok(response) => {
                println!(
                    "round {round}: {} records (cached: {}, breaker engaged: {})",
                    response.records.len(),
                    response.cached,
                    response.breaker_engaged
                );
                for record in &response.records {
                    let price = record
                        .price
                        .map_or_else(|| "n/a".to_string(), |p| format!("{p:.2}"));
                    println!("  #{:<6} {:<40} {price}", record.id, record.name);
                }
            }
            Err(error) => {
                println!("round {round}: HTTP {} ({error})", error.status_code());
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    cache.shutdown().await;
    Ok(())
}
