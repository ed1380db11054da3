//! Minimal walkthrough of the client surface against a local cache.
//!
//! Start a memcached (e.g. `memcached -p 11211`) and run:
//!
//! ```sh
//! cargo run --example basic
//! ```

use std::collections::HashMap;

use memcachesque::prelude::*;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cfg = ClientConfig::with_servers(["127.0.0.1:11211"]).disable_node_provider();
    let client = Client::connect(cfg).await?;

    client.store(StoreMode::Set, "greeting", 60, "hello").await?;
    let resp = client.get("greeting").await?;
    println!("greeting = {:?}", String::from_utf8_lossy(&resp.body));

    let counter = client.delta(DeltaMode::Increment, "visits", 1, 1, 0).await?;
    println!("visits = {counter}");

    let items: HashMap<String, bytes::Bytes> = (0..5)
        .map(|i| (format!("item{i}"), bytes::Bytes::from(format!("value{i}"))))
        .collect();
    client.multi_store(StoreMode::Set, items, 60).await?;

    let fetched = client.multi_get(["item0", "item3", "missing"]).await?;
    println!("fetched {} of 3 keys", fetched.len());

    match client.get("missing").await {
        Err(Error::CacheMiss(_)) => println!("missing is a miss, as expected"),
        other => println!("unexpected: {other:?}"),
    }

    client.close_all_conns();
    Ok(())
}
