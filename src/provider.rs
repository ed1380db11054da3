//! Cluster controller: node health checking and ring rebuilding.
//!
//! Two independent periodic loops run as background tasks and share one
//! broadcast shutdown signal; cancelling stops both within a tick.
//!
//! **Health-check loop.** Re-resolves the authoritative node list, then:
//! re-probes every currently-dead node (dropping it from the dead set if it
//! left the authoritative list or answers a dial again), probes every live
//! ring member, and finally removes every node now in the dead set from the
//! ring and tears down its connection pool.
//!
//! **Rebuild loop.** Re-resolves the node list, subtracts the dead set,
//! diffs the result against current ring membership, applies additions and
//! removals, and (unless disabled) closes one idle connection per pool so
//! reused TCP connections rotate over time.
//!
//! Dial probes use the client's I/O timeout; timeouts are retried up to
//! three times before declaring a node dead, while refusals count
//! immediately. Probes for different nodes run in parallel. The controller
//! never holds two locks at once.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::addr::{Resolver, ServerAddr, join_host_port};
use crate::client::Shared;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::constants::{DEFAULT_CONNS_TO_CLOSE_PER_REBUILD, DEFAULT_RETRY_COUNT_FOR_CONN};
use crate::error::{Error, Result};
use crate::ring::RingNode;

/// Resolve the authoritative node list from the configuration.
///
/// A headless service name takes precedence: its A/AAAA records are joined
/// with the configured port. Otherwise the explicit server list is returned
/// as-is. Nothing is memoized.
pub(crate) async fn resolve_nodes(resolver: &dyn Resolver, cfg: &ClientConfig) -> Result<Vec<String>> {
    if let Some(name) = &cfg.headless_service_address {
        let ips = resolver.lookup_host(name).await?;
        Ok(ips
            .into_iter()
            .map(|ip| join_host_port(&ip, cfg.port))
            .collect())
    } else {
        Ok(cfg.servers.clone())
    }
}

/// Spawn the two controller loops; the returned sender stops both.
pub(crate) fn spawn(shared: Arc<Shared>) -> broadcast::Sender<()> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut hc_rx = shutdown_tx.subscribe();
    let hc_shared = shared.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(hc_shared.cfg.health_check_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the first real run comes one period in.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => check_nodes_health(&hc_shared).await,
                _ = hc_rx.recv() => {
                    debug!("health check loop stopped");
                    return;
                }
            }
        }
    });

    let mut rb_rx = shutdown_tx.subscribe();
    let rb_shared = shared;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(rb_shared.cfg.rebuild_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => rebuild_nodes(&rb_shared).await,
                _ = rb_rx.recv() => {
                    debug!("rebuild loop stopped");
                    return;
                }
            }
        }
    });

    shutdown_tx
}

/// One tick of the health-check loop.
pub(crate) async fn check_nodes_health(shared: &Arc<Shared>) {
    let current = match resolve_nodes(shared.resolver.as_ref(), &shared.cfg).await {
        Ok(nodes) => Arc::new(nodes),
        Err(e) => {
            warn!(error = %e, "health check: node resolution failed");
            return;
        }
    };

    // Re-probe the nodes that were dead last tick.
    let dead = shared.dead_snapshot();
    let mut probes = JoinSet::new();
    for node in dead.iter().cloned() {
        let shared = shared.clone();
        let current = current.clone();
        probes.spawn(async move {
            if !current.contains(&node) {
                // Gone from the authoritative list; stop tracking it.
                shared.remove_dead(&node);
                return;
            }
            if node_is_dead(&shared, &node).await {
                debug!(node = %node, "dead node is still unreachable");
            } else {
                shared.remove_dead(&node);
            }
        });
    }
    while probes.join_next().await.is_some() {}

    // Probe every live ring member that is not already marked dead.
    let mut probes = JoinSet::new();
    for node in shared.ring.all_nodes() {
        if dead.contains(&node.canonical()) {
            continue;
        }
        let shared = shared.clone();
        probes.spawn(async move {
            if node_is_dead(&shared, node.as_str()).await {
                shared.add_dead(node.canonical());
            }
        });
    }
    while probes.join_next().await.is_some() {}

    // Every node now in the dead set leaves the ring and loses its pool.
    let dead = shared.dead_snapshot();
    if !dead.is_empty() {
        warn!(nodes = ?dead, "removing dead nodes from the ring");
        for node in dead {
            let Ok(addr) = ServerAddr::parse(&node) else {
                continue;
            };
            shared.ring.remove(&addr);
            shared.remove_pool(&addr);
        }
    }
}

/// One tick of the rebuild loop.
pub(crate) async fn rebuild_nodes(shared: &Arc<Shared>) {
    let mut current = match resolve_nodes(shared.resolver.as_ref(), &shared.cfg).await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "rebuild: node resolution failed");
            return;
        }
    };
    current.sort();

    // Dead nodes stay out of the ring until the health check revives them.
    let dead = shared.dead_snapshot();
    current.retain(|node| !dead.contains(node));

    let mut in_ring: Vec<String> = shared
        .ring
        .all_nodes()
        .iter()
        .map(|addr| addr.canonical())
        .collect();
    in_ring.sort();

    let to_add: Vec<&String> = current
        .iter()
        .filter(|node| in_ring.binary_search(node).is_err())
        .collect();
    let to_remove: Vec<&String> = in_ring
        .iter()
        .filter(|node| current.binary_search(node).is_err())
        .collect();

    if !to_add.is_empty() || !to_remove.is_empty() {
        debug!(add = ?to_add, remove = ?to_remove, "rebuilding ring membership");
    }

    for node in to_add {
        let Ok(addr) = ServerAddr::parse(node) else {
            continue;
        };
        shared.ring.add(addr);
    }
    for node in to_remove {
        let Ok(addr) = ServerAddr::parse(node) else {
            continue;
        };
        shared.ring.remove(&addr);
        shared.remove_pool(&addr);
    }

    if !shared.cfg.disable_pool_refresh {
        let closed = shared.close_available_conns(DEFAULT_CONNS_TO_CLOSE_PER_REBUILD);
        if closed > 0 {
            debug!(closed, "rotated idle connections");
        }
    }
}

/// Probe a node by dialing it.
///
/// Timeouts are retried up to [`DEFAULT_RETRY_COUNT_FOR_CONN`] times; any
/// other dial error declares the node dead immediately.
async fn node_is_dead(shared: &Shared, node: &str) -> bool {
    let Ok(addr) = ServerAddr::parse(node) else {
        return true;
    };

    let mut retries = 0u8;
    loop {
        match Connection::connect(&addr, shared.cfg.socket_timeout).await {
            Ok(conn) => {
                drop(conn);
                return false;
            }
            Err(Error::ConnectTimeout(_)) if retries < DEFAULT_RETRY_COUNT_FOR_CONN => {
                retries += 1;
            }
            Err(e) => {
                warn!(node, error = %e, "node health probe failed");
                return true;
            }
        }
    }
}
