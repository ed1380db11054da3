//! The sharded client.
//!
//! A [`Client`] multiplexes requests across a pool of cache nodes. Keys are
//! routed through the consistent-hash ring, connections come from bounded
//! per-address pools, and two background loops (unless disabled) keep ring
//! membership converged with the resolved server list.
//!
//! Single-key flow: validate key → ring lookup → acquire connection
//! (running the SASL handshake on first use when auth is enabled) → encode,
//! write, flush → read and classify one response → release the connection
//! on success or a resumable error, destroy it otherwise.
//!
//! Batch flow: keys are partitioned by owning node and each partition is
//! pipelined on one connection as quiet opcodes terminated by a NOOP whose
//! opaque marks end-of-batch.
//!
//! The client is safe for concurrent use; all operations take `&self`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::{Buf, Bytes};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::debug;

use crate::addr::{Resolver, ServerAddr, SystemResolver};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::constants::{DEFAULT_SOCKET_POOLING_TIMEOUT, MAX_KEY_LEN};
use crate::error::{Error, Result};
use crate::metrics::{MetricSink, NoopSink, PrometheusSink};
use crate::pool::Pool;
use crate::protocol::{OpCode, SASL_MECHANISM, Status, prepare_auth_data};
use crate::provider;
use crate::request::{AppendMode, DeltaMode, Request, StoreMode};
use crate::response::Response;
use crate::ring::{HashRing, RingNode};
use crate::telemetry::{self, LogFormat};

/// Reject any key longer than 250 bytes or containing a byte at or below
/// 0x20, or equal to 0x7F.
pub fn legal_key(key: &str) -> bool {
    if key.len() > MAX_KEY_LEN {
        return false;
    }
    key.bytes().all(|b| b > 0x20 && b != 0x7f)
}

/// State shared between the client handle and the controller tasks.
pub(crate) struct Shared {
    pub(crate) cfg: ClientConfig,
    pub(crate) ring: HashRing<ServerAddr>,
    pub(crate) resolver: Arc<dyn Resolver>,
    /// Per-address pools, keyed by canonical address.
    pools: RwLock<HashMap<String, Arc<Pool<Connection>>>>,
    /// Canonical addresses that failed their last probe.
    dead: RwLock<HashSet<String>>,
    metrics: Arc<dyn MetricSink>,
    /// Monotonic request-correlation counter; wraps to zero before
    /// overflowing.
    opaque: AtomicU32,
    /// Prebuilt SASL PLAIN body, when auth is enabled.
    auth_data: Option<Bytes>,
}

impl Shared {
    fn new(cfg: ClientConfig, resolver: Arc<dyn Resolver>) -> Shared {
        let metrics: Arc<dyn MetricSink> = if cfg.disable_diagnostics {
            Arc::new(NoopSink)
        } else {
            Arc::new(PrometheusSink)
        };
        let auth_data = cfg
            .auth
            .as_ref()
            .map(|a| Bytes::from(prepare_auth_data(&a.username, &a.password)));

        Shared {
            cfg,
            ring: HashRing::new(),
            resolver,
            pools: RwLock::new(HashMap::new()),
            dead: RwLock::new(HashSet::new()),
            metrics,
            opaque: AtomicU32::new(0),
            auth_data,
        }
    }

    /// Allocate the next opaque, wrapping to zero before overflow.
    ///
    /// Uniqueness is only needed within one in-flight batch on one
    /// connection, so a plain 32-bit cycle is plenty.
    fn next_opaque(&self) -> u32 {
        let _ = self
            .opaque
            .compare_exchange(u32::MAX, 0, Ordering::SeqCst, Ordering::SeqCst);
        self.opaque.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Fetch or lazily create the pool for an address.
    fn pool_for(&self, addr: &ServerAddr) -> Arc<Pool<Connection>> {
        if let Some(pool) = self
            .pools
            .read()
            .expect("pool map lock poisoned")
            .get(addr.as_str())
        {
            return pool.clone();
        }

        let mut pools = self.pools.write().expect("pool map lock poisoned");
        if let Some(pool) = pools.get(addr.as_str()) {
            return pool.clone();
        }

        let dial_addr = addr.clone();
        let io_timeout = self.cfg.socket_timeout;
        let pool = Arc::new(Pool::new(
            self.cfg.max_idle_conns,
            DEFAULT_SOCKET_POOLING_TIMEOUT,
            move || {
                let addr = dial_addr.clone();
                async move { Connection::connect(&addr, io_timeout).await }
            },
            |conn: Connection| drop(conn),
        ));
        pools.insert(addr.as_str().to_string(), pool.clone());
        pool
    }

    /// Acquire a connection to `addr`, authenticating it first if SASL is
    /// enabled and this connection has not completed the handshake.
    async fn get_conn(&self, addr: &ServerAddr) -> Result<Connection> {
        let pool = self.pool_for(addr);
        let mut conn = pool.acquire().await?;

        if self.auth_data.is_some() && !conn.is_authenticated() {
            if let Err(e) = self.authenticate(&mut conn).await {
                pool.close(conn);
                return Err(e);
            }
        }

        Ok(conn)
    }

    /// Run the SASL PLAIN handshake on a fresh connection.
    async fn authenticate(&self, conn: &mut Connection) -> Result<()> {
        let auth_data = self.auth_data.clone().unwrap_or_default();

        let mut req = Request {
            opcode: OpCode::SaslAuth,
            opaque: self.next_opaque(),
            key: Bytes::from_static(SASL_MECHANISM.as_bytes()),
            body: auth_data.clone(),
            ..Default::default()
        };
        req.prepare_extras(0, 0, 0);
        conn.transmit(&req).await?;
        conn.flush().await?;

        let resp = conn.read_response().await?;
        match resp.status {
            Status::Success => {
                conn.mark_authenticated();
                Ok(())
            }
            Status::AuthContinue => {
                let mut step = Request {
                    opcode: OpCode::SaslStep,
                    opaque: self.next_opaque(),
                    key: Bytes::from_static(SASL_MECHANISM.as_bytes()),
                    body: auth_data,
                    ..Default::default()
                };
                step.prepare_extras(0, 0, 0);
                conn.transmit(&step).await?;
                conn.flush().await?;

                let resp = conn.read_response().await?;
                if resp.status == Status::Success {
                    conn.mark_authenticated();
                    Ok(())
                } else {
                    Err(Error::AuthFail(Box::new(resp)))
                }
            }
            _ => Err(Error::AuthFail(Box::new(resp))),
        }
    }

    /// Release or destroy a connection depending on how its last operation
    /// ended.
    fn finish_conn(&self, conn: Connection, err: Option<&Error>) {
        let resumable = err.map_or(true, Error::is_resumable);
        let pool = self
            .pools
            .read()
            .expect("pool map lock poisoned")
            .get(conn.addr().as_str())
            .cloned();

        match pool {
            Some(pool) if resumable && conn.is_healthy() => pool.release(conn),
            Some(pool) => pool.close(conn),
            // The pool was torn down while this connection was in flight.
            None => drop(conn),
        }
    }

    /// One request/response round trip, with conditional release.
    async fn send(&self, mut conn: Connection, req: &Request) -> Result<Response> {
        let result = self.send_inner(&mut conn, req).await;
        self.finish_conn(conn, result.as_ref().err());
        result
    }

    async fn send_inner(&self, conn: &mut Connection, req: &Request) -> Result<Response> {
        if let Err(e) = conn.transmit(req).await {
            conn.mark_unhealthy();
            return Err(e);
        }
        conn.flush().await?;

        match conn.read_response().await {
            Ok(resp) => resp.into_result(),
            Err(e) => {
                conn.mark_unhealthy();
                Err(e)
            }
        }
    }

    /// The full single-key flow shared by every keyed operation.
    async fn dispatch_key(
        &self,
        opcode: OpCode,
        key: &str,
        body: Bytes,
        expiration: u32,
        delta: u64,
        initial: u64,
    ) -> Result<Response> {
        if !legal_key(key) {
            return Err(Error::MalformedKey);
        }
        let node = self.ring.get(key).ok_or(Error::NoServers)?;
        let conn = self.get_conn(&node).await?;

        let mut req = Request {
            opcode,
            opaque: self.next_opaque(),
            key: Bytes::copy_from_slice(key.as_bytes()),
            body,
            ..Default::default()
        };
        req.prepare_extras(expiration, delta, initial);

        self.send(conn, &req).await
    }

    /// Pipeline GETQ for every key on one connection, terminated by a NOOP
    /// sentinel, and collect the hits.
    async fn pipeline_get(
        &self,
        node: ServerAddr,
        keys: Vec<String>,
    ) -> Result<HashMap<String, Bytes>> {
        let mut conn = self.get_conn(&node).await?;
        let result = self.pipeline_get_inner(&mut conn, keys).await;
        self.finish_conn(conn, result.as_ref().err());
        result
    }

    async fn pipeline_get_inner(
        &self,
        conn: &mut Connection,
        keys: Vec<String>,
    ) -> Result<HashMap<String, Bytes>> {
        let mut id_to_key: HashMap<u32, String> = HashMap::with_capacity(keys.len());

        for key in keys {
            let opaque = self.next_opaque();
            let mut req = Request {
                opcode: OpCode::GetQ,
                opaque,
                key: Bytes::from(key.clone().into_bytes()),
                ..Default::default()
            };
            req.prepare_extras(0, 0, 0);

            if let Err(e) = conn.transmit(&req).await {
                conn.mark_unhealthy();
                return Err(e);
            }
            id_to_key.insert(opaque, key);
        }

        let noop_opaque = self.write_noop_sentinel(conn).await?;

        let mut ret = HashMap::with_capacity(id_to_key.len());
        loop {
            let resp = match conn.read_response().await {
                Ok(resp) => resp,
                Err(e) => {
                    conn.mark_unhealthy();
                    return Err(e);
                }
            };

            if resp.opcode == OpCode::Noop && resp.opaque == noop_opaque {
                break;
            }

            if let Some(key) = id_to_key.get(&resp.opaque) {
                match resp.status {
                    Status::Success => {
                        ret.insert(key.clone(), resp.body);
                    }
                    // A miss is simply absent from the result map.
                    Status::KeyNotFound => {}
                    _ => {
                        let err = Error::from_response(resp);
                        if err.is_resumable() {
                            debug!(key = %key, error = %err, "dropping failed key from batch get");
                        } else {
                            conn.mark_unhealthy();
                            return Err(err);
                        }
                    }
                }
            }
        }

        Ok(ret)
    }

    /// Pipeline a quiet write opcode for every item on one connection.
    ///
    /// Returns the resumable per-key status failures; a fatal status or a
    /// transport error aborts the batch as `Err` and marks the connection
    /// unhealthy.
    async fn pipeline_write(
        &self,
        opcode: OpCode,
        node: ServerAddr,
        items: Vec<(String, Bytes)>,
        expiration: u32,
        ignore_miss: bool,
    ) -> Result<()> {
        let mut conn = self.get_conn(&node).await?;
        let result = self
            .pipeline_write_inner(&mut conn, opcode, items, expiration, ignore_miss)
            .await;

        match result {
            Ok(status_errors) => {
                // Fatal statuses abort the read loop, so only resumable
                // per-key failures reach this branch. Re-check before
                // releasing so a fatal entry can never leak a connection
                // back into the pool.
                match status_errors.iter().find(|e| !e.is_resumable()) {
                    Some(fatal) => self.finish_conn(conn, Some(fatal)),
                    None => self.finish_conn(conn, status_errors.first()),
                }
                Error::join(status_errors)
            }
            Err(fatal) => {
                self.finish_conn(conn, Some(&fatal));
                Err(fatal)
            }
        }
    }

    async fn pipeline_write_inner(
        &self,
        conn: &mut Connection,
        opcode: OpCode,
        items: Vec<(String, Bytes)>,
        expiration: u32,
        ignore_miss: bool,
    ) -> Result<Vec<Error>> {
        let mut id_to_key: HashMap<u32, String> = HashMap::with_capacity(items.len());

        for (key, body) in items {
            let opaque = self.next_opaque();
            let mut req = Request {
                opcode,
                opaque,
                key: Bytes::from(key.clone().into_bytes()),
                body,
                ..Default::default()
            };
            req.prepare_extras(expiration, 0, 0);

            if let Err(e) = conn.transmit(&req).await {
                conn.mark_unhealthy();
                return Err(e);
            }
            id_to_key.insert(opaque, key);
        }

        let noop_opaque = self.write_noop_sentinel(conn).await?;

        let mut status_errors = Vec::new();
        loop {
            let resp = match conn.read_response().await {
                Ok(resp) => resp,
                Err(e) => {
                    conn.mark_unhealthy();
                    return Err(e);
                }
            };

            if resp.opcode == OpCode::Noop && resp.opaque == noop_opaque {
                break;
            }

            if let Some(key) = id_to_key.get(&resp.opaque) {
                match resp.status {
                    Status::Success => {}
                    Status::KeyNotFound if ignore_miss => {}
                    _ => {
                        debug!(key = %key, status = %resp.status, "batch write failed for key");
                        let err = Error::from_response(resp);
                        if err.is_resumable() {
                            status_errors.push(err);
                        } else {
                            conn.mark_unhealthy();
                            return Err(err);
                        }
                    }
                }
            }
        }

        Ok(status_errors)
    }

    /// Append the end-of-batch NOOP and flush the pipeline.
    async fn write_noop_sentinel(&self, conn: &mut Connection) -> Result<u32> {
        let noop_opaque = self.next_opaque();
        let mut noop = Request {
            opcode: OpCode::Noop,
            opaque: noop_opaque,
            ..Default::default()
        };
        noop.prepare_extras(0, 0, 0);

        if let Err(e) = conn.transmit(&noop).await {
            conn.mark_unhealthy();
            return Err(e);
        }
        if let Err(e) = conn.flush().await {
            conn.mark_unhealthy();
            return Err(e);
        }
        Ok(noop_opaque)
    }

    /// Group keys by owning node, validating every key first.
    fn partition_keys(&self, keys: &[String]) -> Result<HashMap<String, (ServerAddr, Vec<String>)>> {
        let mut partitions: HashMap<String, (ServerAddr, Vec<String>)> =
            HashMap::with_capacity(self.ring.nodes_count());

        for key in keys {
            if !legal_key(key) {
                return Err(Error::MalformedKey);
            }
            if let Some(node) = self.ring.get(key) {
                partitions
                    .entry(node.canonical())
                    .or_insert_with(|| (node.clone(), Vec::new()))
                    .1
                    .push(key.clone());
            }
        }

        Ok(partitions)
    }

    // -------------------------------------------------------------------------
    // Controller support
    // -------------------------------------------------------------------------

    pub(crate) fn dead_snapshot(&self) -> HashSet<String> {
        self.dead.read().expect("dead set lock poisoned").clone()
    }

    pub(crate) fn add_dead(&self, node: String) {
        self.dead.write().expect("dead set lock poisoned").insert(node);
    }

    pub(crate) fn remove_dead(&self, node: &str) {
        self.dead.write().expect("dead set lock poisoned").remove(node);
    }

    /// Destroy and forget the pool for an address.
    pub(crate) fn remove_pool(&self, addr: &ServerAddr) {
        let pool = self
            .pools
            .write()
            .expect("pool map lock poisoned")
            .remove(addr.as_str());
        if let Some(pool) = pool {
            pool.destroy();
        }
    }

    /// Close up to `num` idle connections in every pool; returns how many
    /// were closed.
    pub(crate) fn close_available_conns(&self, num: usize) -> usize {
        let pools: Vec<Arc<Pool<Connection>>> = self
            .pools
            .read()
            .expect("pool map lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut closed = 0;
        for pool in pools {
            for _ in 0..num {
                if let Some(conn) = pool.pop() {
                    pool.close(conn);
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Destroy every pool.
    pub(crate) fn destroy_all_pools(&self) {
        let pools: Vec<Arc<Pool<Connection>>> = {
            let mut map = self.pools.write().expect("pool map lock poisoned");
            map.drain().map(|(_, p)| p).collect()
        };
        for pool in pools {
            pool.destroy();
        }
    }
}

/// A sharded memcached client.
///
/// Cheap to share behind `&`; every operation takes `&self`. Dropping the
/// client stops the background controller.
pub struct Client {
    shared: Arc<Shared>,
    shutdown: Option<broadcast::Sender<()>>,
}

impl Client {
    /// Build a client from a configuration, using the system resolver.
    pub async fn connect(cfg: ClientConfig) -> Result<Client> {
        Self::connect_with_resolver(cfg, Arc::new(SystemResolver)).await
    }

    /// Build a client from `MEMCACHED_*` environment variables.
    pub async fn from_env() -> Result<Client> {
        Self::connect(ClientConfig::from_env()?).await
    }

    /// Build a client with a custom resolver (fakes in tests, custom DNS
    /// stacks in production).
    pub async fn connect_with_resolver(
        cfg: ClientConfig,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Client> {
        cfg.validate()?;

        if !cfg.disable_logs {
            // Best effort; an already-installed subscriber wins.
            let _ = telemetry::init_logging(LogFormat::from_env());
        }

        let nodes = provider::resolve_nodes(resolver.as_ref(), &cfg).await?;
        let shared = Arc::new(Shared::new(cfg, resolver));

        for node in &nodes {
            shared.ring.add(ServerAddr::parse(node)?);
        }
        debug!(nodes = nodes.len(), "client initialized");

        let shutdown = if shared.cfg.disable_node_provider {
            None
        } else {
            Some(provider::spawn(shared.clone()))
        };

        Ok(Client { shared, shutdown })
    }

    /// Number of nodes currently on the ring.
    pub fn nodes_count(&self) -> usize {
        self.shared.ring.nodes_count()
    }

    /// Test-only access to the shared state.
    #[cfg(test)]
    pub(crate) fn shared_for_tests(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    fn observe(&self, method: &'static str, start: Instant, success: bool) {
        self.shared
            .metrics
            .observe_method(method, start.elapsed().as_secs_f64(), success);
    }

    /// Fetch the value stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Response> {
        let start = Instant::now();
        let res = self
            .shared
            .dispatch_key(OpCode::Get, key, Bytes::new(), 0, 0, 0)
            .await;
        self.observe("Get", start, res.is_ok());
        res
    }

    /// Write `body` under `key` with the given store mode and expiration.
    ///
    /// An expiration of 0 means no expiry.
    pub async fn store(
        &self,
        mode: StoreMode,
        key: &str,
        expiration: u32,
        body: impl Into<Bytes>,
    ) -> Result<Response> {
        let start = Instant::now();
        let res = self
            .shared
            .dispatch_key(mode.resolve(), key, body.into(), expiration, 0, 0)
            .await;
        self.observe("Store", start, res.is_ok());
        res
    }

    /// Delete the value under `key`; a missing key is a cache miss.
    pub async fn delete(&self, key: &str) -> Result<Response> {
        let start = Instant::now();
        let res = self
            .shared
            .dispatch_key(OpCode::Delete, key, Bytes::new(), 0, 0, 0)
            .await;
        self.observe("Delete", start, res.is_ok());
        res
    }

    /// Atomically adjust the numeric value under `key` by `delta`,
    /// initializing an absent key to `initial`. Returns the new value.
    pub async fn delta(
        &self,
        mode: DeltaMode,
        key: &str,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<u64> {
        let start = Instant::now();
        let res = self
            .shared
            .dispatch_key(mode.resolve(), key, Bytes::new(), expiration, delta, initial)
            .await;
        self.observe("Delta", start, res.is_ok());

        let resp = res?;
        let mut body = resp.body.clone();
        if body.len() < 8 {
            return Err(Error::Io(std::io::ErrorKind::InvalidData));
        }
        Ok(body.get_u64())
    }

    /// Attach `data` to an existing value; fails with not-stored when the
    /// key is absent.
    pub async fn append(
        &self,
        mode: AppendMode,
        key: &str,
        data: impl Into<Bytes>,
    ) -> Result<Response> {
        let start = Instant::now();
        let res = self
            .shared
            .dispatch_key(mode.resolve(), key, data.into(), 0, 0, 0)
            .await;
        self.observe("Append", start, res.is_ok());
        res
    }

    /// Flush every node's cache, in parallel; joins per-node errors.
    pub async fn flush_all(&self, expiration: u32) -> Result<()> {
        let start = Instant::now();
        let res = self.flush_all_inner(expiration).await;
        self.observe("FlushAll", start, res.is_ok());
        res
    }

    async fn flush_all_inner(&self, expiration: u32) -> Result<()> {
        let mut join = JoinSet::new();
        for node in self.shared.ring.all_nodes() {
            let shared = self.shared.clone();
            join.spawn(async move {
                let conn = shared.get_conn(&node).await?;
                let mut req = Request {
                    opcode: OpCode::Flush,
                    opaque: shared.next_opaque(),
                    ..Default::default()
                };
                req.prepare_extras(expiration, 0, 0);
                shared.send(conn, &req).await.map(|_| ())
            });
        }

        Error::join(collect_task_errors(&mut join).await)
    }

    /// Batch get. The returned map may have fewer entries than `keys`;
    /// misses are simply absent and are never an error.
    pub async fn multi_get<I, S>(&self, keys: I) -> Result<HashMap<String, Bytes>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let start = Instant::now();
        let res = self.multi_get_inner(keys).await;
        self.observe("MultiGet", start, res.is_ok());
        res
    }

    async fn multi_get_inner(&self, keys: Vec<String>) -> Result<HashMap<String, Bytes>> {
        if keys.len() == 1 {
            let key = &keys[0];
            return match self
                .shared
                .dispatch_key(OpCode::Get, key, Bytes::new(), 0, 0, 0)
                .await
            {
                Ok(resp) => Ok(HashMap::from([(key.clone(), resp.body)])),
                Err(Error::CacheMiss(_)) => Ok(HashMap::new()),
                Err(e) => Err(e),
            };
        }

        let partitions = self.shared.partition_keys(&keys)?;

        let mut join = JoinSet::new();
        for (_canonical, (node, node_keys)) in partitions {
            let shared = self.shared.clone();
            join.spawn(async move { shared.pipeline_get(node, node_keys).await });
        }

        let mut ret = HashMap::with_capacity(keys.len());
        let mut errors = Vec::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(Ok(part)) => ret.extend(part),
                Ok(Err(e)) => errors.push(e),
                Err(_panicked) => errors.push(Error::Io(std::io::ErrorKind::Other)),
            }
        }

        Error::join(errors)?;
        Ok(ret)
    }

    /// Batch store: writes every item with the given mode and expiration.
    /// Per-key failures from all nodes are joined into one error.
    pub async fn multi_store(
        &self,
        mode: StoreMode,
        items: HashMap<String, Bytes>,
        expiration: u32,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let quiet = mode.resolve().to_quiet();
        let keys: Vec<String> = items.keys().cloned().collect();
        let res = self
            .multi_write_inner(quiet, keys, items, expiration, false)
            .await;
        self.observe("MultiStore", start, res.is_ok());
        res
    }

    /// Batch delete; missing keys are ignored.
    pub async fn multi_delete<I, S>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let res = self
            .multi_write_inner(OpCode::DeleteQ, keys, HashMap::new(), 0, true)
            .await;
        self.observe("MultiDelete", start, res.is_ok());
        res
    }

    async fn multi_write_inner(
        &self,
        opcode: OpCode,
        keys: Vec<String>,
        mut bodies: HashMap<String, Bytes>,
        expiration: u32,
        ignore_miss: bool,
    ) -> Result<()> {
        let partitions = self.shared.partition_keys(&keys)?;

        let mut join = JoinSet::new();
        for (_canonical, (node, node_keys)) in partitions {
            let items: Vec<(String, Bytes)> = node_keys
                .into_iter()
                .map(|key| {
                    let body = bodies.remove(&key).unwrap_or_default();
                    (key, body)
                })
                .collect();

            let shared = self.shared.clone();
            join.spawn(async move {
                shared
                    .pipeline_write(opcode, node, items, expiration, ignore_miss)
                    .await
            });
        }

        Error::join(collect_task_errors(&mut join).await)
    }

    /// Destroy every per-address pool. Once closed, resources are released
    /// and subsequent operations will redial lazily.
    pub fn close_all_conns(&self) {
        self.shared.destroy_all_pools();
    }

    /// Close up to `num` idle connections in each shard's pool; returns the
    /// number closed.
    pub fn close_available_conns_in_all_pools(&self, num: usize) -> usize {
        self.shared.close_available_conns(num)
    }

    /// Stop the controller loops and tear down all pools.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.shutdown {
            let _ = tx.send(());
        }
        self.shared.destroy_all_pools();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(tx) = &self.shutdown {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("nodes", &self.shared.ring.nodes_count())
            .field("controller", &self.shutdown.is_some())
            .finish()
    }
}

/// Drain a JoinSet of `Result<()>` tasks into the list of their errors.
async fn collect_task_errors(join: &mut JoinSet<Result<()>>) -> Vec<Error> {
    let mut errors = Vec::new();
    while let Some(joined) = join.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(_panicked) => errors.push(Error::Io(std::io::ErrorKind::Other)),
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_key_accepts_normal_keys() {
        assert!(legal_key("foo"));
        assert!(legal_key("a"));
        assert!(legal_key("Hello_世界"));
        assert!(legal_key(&"k".repeat(250)));
    }

    #[test]
    fn test_legal_key_rejects_whitespace_and_control() {
        assert!(!legal_key("foo bar"));
        assert!(!legal_key("foo\x7f"));
        assert!(!legal_key("foo\nbar"));
        assert!(!legal_key("foo\0bar"));
        assert!(!legal_key(""));
        assert!(!legal_key(&"k".repeat(251)));
    }

    fn test_shared() -> Shared {
        Shared::new(
            ClientConfig::with_servers(["127.0.0.1:11211"]),
            Arc::new(SystemResolver),
        )
    }

    #[test]
    fn test_opaque_is_monotonic() {
        let shared = test_shared();
        let a = shared.next_opaque();
        let b = shared.next_opaque();
        let c = shared.next_opaque();
        assert_eq!(b, a + 1);
        assert_eq!(c, b + 1);
    }

    #[test]
    fn test_opaque_wraps_before_overflow() {
        let shared = test_shared();
        shared.opaque.store(u32::MAX, Ordering::SeqCst);
        // The counter resets to zero first, so the next opaque is 1.
        assert_eq!(shared.next_opaque(), 1);
    }

    #[test]
    fn test_pool_for_is_cached() {
        let shared = test_shared();
        let addr = ServerAddr::parse("127.0.0.1:11211").unwrap();
        let a = shared.pool_for(&addr);
        let b = shared.pool_for(&addr);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_partition_keys_rejects_bad_key() {
        let shared = test_shared();
        shared.ring.add(ServerAddr::parse("127.0.0.1:11211").unwrap());
        let keys = vec!["good".to_string(), "bad key".to_string()];
        assert!(matches!(
            shared.partition_keys(&keys),
            Err(Error::MalformedKey)
        ));
    }

    #[test]
    fn test_partition_keys_groups_by_node() {
        let shared = test_shared();
        shared.ring.add(ServerAddr::parse("10.0.0.1:11211").unwrap());
        shared.ring.add(ServerAddr::parse("10.0.0.2:11211").unwrap());

        let keys: Vec<String> = (0..100).map(|i| format!("key{i}")).collect();
        let partitions = shared.partition_keys(&keys).unwrap();

        let total: usize = partitions.values().map(|(_, ks)| ks.len()).sum();
        assert_eq!(total, 100);
        assert!(!partitions.is_empty() && partitions.len() <= 2);
    }

    #[test]
    fn test_partition_keys_on_empty_ring_is_empty() {
        let shared = test_shared();
        let keys = vec!["k".to_string()];
        assert!(shared.partition_keys(&keys).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_configuration() {
        let err = Client::connect(ClientConfig::default()).await.unwrap_err();
        assert_eq!(err, Error::NotConfigured);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_server() {
        let cfg = ClientConfig::with_servers(["not-an-address"]).disable_node_provider();
        let err = Client::connect(cfg).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddr(_)));
    }

    #[tokio::test]
    async fn test_operations_on_empty_ring_fail_with_no_servers() {
        // A headless name that resolves to nothing leaves the ring empty.
        struct EmptyResolver;
        #[async_trait::async_trait]
        impl Resolver for EmptyResolver {
            async fn lookup_host(&self, _host: &str) -> Result<Vec<String>> {
                Ok(vec![])
            }
        }

        let cfg = ClientConfig::default()
            .headless_service("cache.svc.local")
            .disable_node_provider()
            .disable_diagnostics();
        let client = Client::connect_with_resolver(cfg, Arc::new(EmptyResolver))
            .await
            .unwrap();

        assert_eq!(client.get("foo").await.unwrap_err(), Error::NoServers);
        assert_eq!(
            client
                .store(StoreMode::Set, "foo", 0, Bytes::from_static(b"v"))
                .await
                .unwrap_err(),
            Error::NoServers
        );
    }

    #[tokio::test]
    async fn test_malformed_key_rejected_before_routing() {
        let cfg = ClientConfig::with_servers(["127.0.0.1:11211"])
            .disable_node_provider()
            .disable_diagnostics();
        let client = Client::connect(cfg).await.unwrap();

        assert_eq!(client.get("bad key").await.unwrap_err(), Error::MalformedKey);
        assert_eq!(
            client.delete(&"x".repeat(251)).await.unwrap_err(),
            Error::MalformedKey
        );
        // Batch calls fail as a whole on the first invalid key.
        assert_eq!(
            client
                .multi_get(["ok", "bad key"])
                .await
                .unwrap_err(),
            Error::MalformedKey
        );
    }

    #[tokio::test]
    async fn test_multi_get_empty_input() {
        let cfg = ClientConfig::with_servers(["127.0.0.1:11211"])
            .disable_node_provider()
            .disable_diagnostics();
        let client = Client::connect(cfg).await.unwrap();
        let got = client.multi_get(Vec::<String>::new()).await.unwrap();
        assert!(got.is_empty());
    }
}
