//! The replication manager: roles, log shipping, acknowledgements,
//! elections and client synchronization.
//!
//! Each manager runs one message loop thread. A master ships log records
//! from inside [`Environment::commit`] through the [`LogShipper`] hook and
//! waits there for acknowledgements. Clients apply shipped records in LSN
//! order on the message loop.

use crate::config::ReplicationConfig;
use crate::error::{ReplError, ReplResult};
use crate::message::{self, Envelope, Message, SiteId};
use crate::transport::Transport;
use lodedb_core::wal::WalRecordType;
use lodedb_core::{Environment, LogShipper, Lsn, ReplicaAck, WriteGate};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Role of a site in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts writes and ships its log.
    Master,
    /// Applies the master's log.
    Client,
    /// Taking part in an election.
    Electing,
}

impl Role {
    /// Lower-case name.
    pub fn name(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Client => "client",
            Role::Electing => "electing",
        }
    }
}

/// Result of an election this site took part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionOutcome {
    /// Generation of the new master.
    pub generation: u32,
    /// The winning site.
    pub winner: SiteId,
    /// Votes counted.
    pub votes: usize,
}

/// Counters kept by a manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplStats {
    /// Log records sent by this site as master.
    pub records_shipped: u64,
    /// Shipped records applied by this site as client.
    pub records_applied: u64,
    /// Acknowledgements received as master.
    pub acks_received: u64,
    /// Log requests sent as client.
    pub log_requests: u64,
    /// Elections this site voted in.
    pub elections: u64,
    /// Elections this site won.
    pub elections_won: u64,
    /// Log rollbacks performed while syncing with a new master.
    pub rollbacks: u64,
    /// Times this site found another master while being master.
    pub duplicate_masters: u64,
}

/// Point-in-time view of a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteStatus {
    /// This site.
    pub site: SiteId,
    /// Current role.
    pub role: Role,
    /// Master generation this site follows (or leads).
    pub generation: u32,
    /// Known master.
    pub master: Option<SiteId>,
    /// Whether a client has verified its log against the master's.
    pub synced: bool,
    /// End of the local log.
    pub end_lsn: Lsn,
    /// Newest local commit.
    pub last_commit: Lsn,
}

#[derive(Debug, Clone, Copy)]
struct Vote {
    last_commit: Lsn,
    priority: u32,
}

#[derive(Debug)]
struct Election {
    egen: u32,
    votes: HashMap<SiteId, Vote>,
    deadline: Instant,
}

#[derive(Debug, Clone)]
enum Decision {
    Won { votes: usize },
    Lost { winner: SiteId, votes: usize },
    NoQuorum { votes: usize },
    NoElectable,
    Failed(String),
}

#[derive(Debug)]
enum SyncPhase {
    Unsynced,
    Verifying { candidates: Vec<Lsn>, asked: Lsn },
    Ready,
}

#[derive(Debug)]
struct State {
    role: Role,
    gen: u32,
    master: Option<SiteId>,
    sync: SyncPhase,
    requested: Option<Lsn>,
    shipped: Lsn,
    acks: HashMap<SiteId, Lsn>,
    egen: u32,
    election: Option<Election>,
    decided: Option<(u32, Decision)>,
    await_master_until: Option<Instant>,
    demoted: bool,
    stats: ReplStats,
}

impl State {
    fn new() -> Self {
        Self {
            role: Role::Client,
            gen: 0,
            master: None,
            sync: SyncPhase::Unsynced,
            requested: None,
            shipped: Lsn::ZERO,
            acks: HashMap::new(),
            egen: 0,
            election: None,
            decided: None,
            await_master_until: None,
            demoted: false,
            stats: ReplStats::default(),
        }
    }
}

struct Inner {
    config: ReplicationConfig,
    env: Arc<Environment>,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    changed: Condvar,
    ship_lock: Mutex<()>,
    stop: AtomicBool,
}

/// Replication for one environment.
///
/// ```rust,ignore
/// let net = InProcessNetwork::new();
/// let master = ReplicationManager::start(env1, Arc::new(net.join(1)), ReplicationConfig::new(1, 2))?;
/// let client = ReplicationManager::start(env2, Arc::new(net.join(2)), ReplicationConfig::new(2, 2))?;
/// master.start_master()?;
/// ```
pub struct ReplicationManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shipper {
    inner: Weak<Inner>,
}

impl LogShipper for Shipper {
    fn on_commit(&self, lsn: Lsn) -> ReplicaAck {
        match self.inner.upgrade() {
            Some(inner) => inner.ship_and_wait(lsn),
            None => ReplicaAck::NotReplicated,
        }
    }
}

fn record_end(lsn: Lsn, len: usize) -> Lsn {
    Lsn::new(lsn.file(), lsn.offset() + len as u32)
}

impl ReplicationManager {
    /// Attaches replication to `env` and starts the message loop. The site
    /// starts as a client and asks the group for its master.
    ///
    /// # Errors
    ///
    /// `ReplError::Config` for an invalid configuration or a transport
    /// belonging to another site; I/O errors spawning the loop.
    pub fn start(
        env: Arc<Environment>,
        transport: Arc<dyn Transport>,
        config: ReplicationConfig,
    ) -> ReplResult<Self> {
        config.validate()?;
        if transport.site_id() != config.site_id {
            return Err(ReplError::Config(format!(
                "transport belongs to site {}, config to site {}",
                transport.site_id(),
                config.site_id
            )));
        }
        env.set_write_gate(WriteGate::NotMaster);

        let inner = Arc::new(Inner {
            config,
            env,
            transport,
            state: Mutex::new(State::new()),
            changed: Condvar::new(),
            ship_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
        });
        let shipper: Arc<dyn LogShipper> = Arc::new(Shipper {
            inner: Arc::downgrade(&inner),
        });
        inner.env.set_log_shipper(Some(shipper));

        let looped = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name(format!("lodedb-repl-{}", inner.config.site_id))
            .spawn(move || looped.run())?;

        tracing::info!(
            site = inner.config.site_id,
            nsites = inner.config.nsites,
            priority = inner.config.priority,
            "replication started"
        );
        inner.send_all(&Message::MasterQuery);
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Makes this site master in a new generation and announces it.
    ///
    /// # Errors
    ///
    /// Environment errors from promotion.
    pub fn start_master(&self) -> ReplResult<u32> {
        self.inner.check_running()?;
        let gen = {
            let mut st = self.inner.state.lock();
            let gen = st.egen.max(st.gen) + 1;
            st.egen = gen;
            st.election = None;
            st.demoted = false;
            gen
        };
        self.inner.become_master(gen)?;
        Ok(gen)
    }

    /// Makes this site a client and asks for the current master.
    ///
    /// # Errors
    ///
    /// `Shutdown` after [`shutdown`](Self::shutdown).
    pub fn start_client(&self) -> ReplResult<()> {
        self.inner.check_running()?;
        {
            let mut st = self.inner.state.lock();
            if st.role == Role::Master {
                tracing::info!(site = self.inner.config.site_id, gen = st.gen, "stepping down");
            }
            st.role = Role::Client;
            st.master = None;
            st.sync = SyncPhase::Unsynced;
            st.demoted = false;
            st.acks.clear();
        }
        self.inner.env.set_write_gate(WriteGate::NotMaster);
        self.inner.send_all(&Message::MasterQuery);
        Ok(())
    }

    /// Starts an election and waits for its result.
    ///
    /// # Errors
    ///
    /// - `WrongRole` on a master
    /// - `ElectionFailed` if fewer than a majority of sites voted
    /// - `NoElectableSite` if every voter has priority 0
    /// - `Timeout` if no decision was reached
    pub fn hold_election(&self) -> ReplResult<ElectionOutcome> {
        self.inner.check_running()?;
        let timeout = self.inner.config.election_timeout;
        let egen = {
            let mut st = self.inner.state.lock();
            if st.role == Role::Master {
                return Err(ReplError::WrongRole {
                    expected: "client",
                    actual: st.role.name(),
                });
            }
            let egen = st.egen.max(st.gen) + 1;
            self.inner.join_election(&mut st, egen);
            egen
        };
        self.inner.cast_vote(egen);

        let give_up = Instant::now() + timeout * 3;
        let mut st = self.inner.state.lock();
        loop {
            if let Some((decided, decision)) = st.decided.clone() {
                if decided >= egen {
                    return Self::outcome(&self.inner.config, decided, decision);
                }
            }
            if self.inner.changed.wait_until(&mut st, give_up).timed_out() {
                return Err(ReplError::Timeout("election result"));
            }
        }
    }

    fn outcome(config: &ReplicationConfig, generation: u32, decision: Decision) -> ReplResult<ElectionOutcome> {
        match decision {
            Decision::Won { votes } => Ok(ElectionOutcome {
                generation,
                winner: config.site_id,
                votes,
            }),
            Decision::Lost { winner, votes } => Ok(ElectionOutcome {
                generation,
                winner,
                votes,
            }),
            Decision::NoQuorum { votes } => Err(ReplError::ElectionFailed {
                generation,
                votes,
                needed: config.majority(),
            }),
            Decision::NoElectable => Err(ReplError::NoElectableSite { generation }),
            Decision::Failed(reason) => Err(ReplError::Promotion(reason)),
        }
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.inner.state.lock().role
    }

    /// Master generation this site follows or leads.
    pub fn generation(&self) -> u32 {
        self.inner.state.lock().gen
    }

    /// Known master, if any.
    pub fn master(&self) -> Option<SiteId> {
        self.inner.state.lock().master
    }

    /// Snapshot of the site.
    pub fn status(&self) -> SiteStatus {
        let st = self.inner.state.lock();
        SiteStatus {
            site: self.inner.config.site_id,
            role: st.role,
            generation: st.gen,
            master: st.master,
            synced: st.role == Role::Master || matches!(st.sync, SyncPhase::Ready),
            end_lsn: self.inner.env.end_lsn(),
            last_commit: self.inner.env.last_commit_lsn(),
        }
    }

    /// Counters.
    pub fn stats(&self) -> ReplStats {
        self.inner.state.lock().stats.clone()
    }

    /// The replicated environment.
    pub fn env(&self) -> &Arc<Environment> {
        &self.inner.env
    }

    /// Waits until the site has the given role.
    pub fn wait_for_role(&self, role: Role, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock();
        while st.role != role {
            if self.inner.changed.wait_until(&mut st, deadline).timed_out() {
                return st.role == role;
            }
        }
        true
    }

    /// Waits until a client is synced and has applied the commit at `lsn`.
    ///
    /// # Errors
    ///
    /// `Timeout` if it does not happen in time.
    pub fn wait_for_commit(&self, lsn: Lsn, timeout: Duration) -> ReplResult<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock();
        loop {
            let synced = st.role == Role::Master || matches!(st.sync, SyncPhase::Ready);
            if synced && self.inner.env.last_commit_lsn() >= lsn {
                return Ok(());
            }
            if self.inner.changed.wait_until(&mut st, deadline).timed_out() {
                return Err(ReplError::Timeout("replicated commit"));
            }
        }
    }

    /// Stops the message loop and detaches from the environment. Called
    /// on drop.
    pub fn shutdown(&self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.env.set_log_shipper(None);
        self.inner.changed.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!(site = self.inner.config.site_id, "replication loop panicked");
            }
        }
        tracing::info!(site = self.inner.config.site_id, "replication stopped");
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("ReplicationManager")
            .field("site", &self.inner.config.site_id)
            .field("role", &st.role)
            .field("gen", &st.gen)
            .field("master", &st.master)
            .finish()
    }
}

impl Inner {
    fn check_running(&self) -> ReplResult<()> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(ReplError::Shutdown);
        }
        Ok(())
    }

    fn me(&self) -> SiteId {
        self.config.site_id
    }

    fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.transport.recv(self.config.poll_interval) {
                Ok(Some(envelope)) => {
                    let name = envelope.message.name();
                    let from = envelope.from;
                    if let Err(e) = self.handle(envelope) {
                        tracing::warn!(site = self.me(), from, message = name, error = %e, "message handling failed");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(site = self.me(), error = %e, "receive failed"),
            }
            self.tick();
        }
    }

    fn send(&self, to: SiteId, message: &Message) {
        if let Err(e) = self.transport.send(to, message) {
            tracing::debug!(site = self.me(), to, message = message.name(), error = %e, "send failed");
        }
    }

    fn send_all(&self, message: &Message) {
        if let Err(e) = self.transport.broadcast(message) {
            tracing::debug!(site = self.me(), message = message.name(), error = %e, "broadcast failed");
        }
    }

    fn handle(&self, envelope: Envelope) -> ReplResult<()> {
        let from = envelope.from;
        if from == self.me() {
            return Ok(());
        }
        match envelope.message {
            Message::Log { gen, lsn, bytes } => self.on_log(from, gen, message::lsn(lsn), &bytes),
            Message::Ack { gen, lsn } => {
                self.on_ack(from, gen, message::lsn(lsn));
                Ok(())
            }
            Message::LogRequest { gen, from: start } => self.on_log_request(from, gen, message::lsn(start)),
            Message::VerifyRequest { gen, lsn } => {
                self.on_verify_request(from, gen, message::lsn(lsn));
                Ok(())
            }
            Message::VerifyReply { gen, lsn, bytes } => self.on_verify_reply(from, gen, message::lsn(lsn), bytes),
            Message::Vote {
                egen,
                last_commit,
                priority,
            } => {
                self.on_vote(from, egen, message::lsn(last_commit), priority);
                Ok(())
            }
            Message::NewMaster { gen, site } => self.on_new_master(from, gen, site),
            Message::MasterQuery => {
                let gen = {
                    let st = self.state.lock();
                    (st.role == Role::Master).then_some(st.gen)
                };
                if let Some(gen) = gen {
                    self.send(from, &Message::NewMaster { gen, site: self.me() });
                }
                Ok(())
            }
        }
    }

    // ---- master side ----

    fn become_master(&self, gen: u32) -> ReplResult<()> {
        let rolled_back = self.env.promote()?;
        {
            let mut st = self.state.lock();
            st.role = Role::Master;
            st.gen = gen;
            st.master = Some(self.me());
            st.sync = SyncPhase::Ready;
            st.requested = None;
            st.shipped = self.env.end_lsn();
            st.acks.clear();
            st.await_master_until = None;
        }
        self.changed.notify_all();
        tracing::info!(
            site = self.me(),
            gen,
            rolled_back = rolled_back.len(),
            "site is master"
        );
        self.send_all(&Message::NewMaster { gen, site: self.me() });
        Ok(())
    }

    fn ship_and_wait(&self, commit: Lsn) -> ReplicaAck {
        let gen = {
            let st = self.state.lock();
            if st.role != Role::Master {
                return ReplicaAck::NotReplicated;
            }
            st.gen
        };
        if let Err(e) = self.ship_pending(gen) {
            tracing::warn!(site = self.me(), error = %e, "log shipping failed");
        }

        let required = self.config.ack_policy.required(self.config.nsites);
        if required == 0 {
            return ReplicaAck::NotReplicated;
        }
        let deadline = Instant::now() + self.config.ack_timeout;
        let mut st = self.state.lock();
        loop {
            let acks = st.acks.values().filter(|&&acked| acked >= commit).count();
            if acks >= required {
                return ReplicaAck::Acknowledged { acks };
            }
            if st.role != Role::Master || self.changed.wait_until(&mut st, deadline).timed_out() {
                let acks = st.acks.values().filter(|&&acked| acked >= commit).count();
                if acks >= required {
                    return ReplicaAck::Acknowledged { acks };
                }
                tracing::debug!(site = self.me(), %commit, acks, required, "ack policy not met");
                return ReplicaAck::Insufficient { acks, required };
            }
        }
    }

    /// Broadcasts every record written since the last shipment.
    fn ship_pending(&self, gen: u32) -> ReplResult<()> {
        let _order = self.ship_lock.lock();
        let mut from = self.state.lock().shipped;
        let mut sent = 0u64;
        loop {
            let batch = self.env.read_log_raw(from, self.config.request_batch)?;
            if batch.is_empty() {
                break;
            }
            for (lsn, bytes) in batch {
                from = record_end(lsn, bytes.len());
                self.transport.broadcast(&Message::Log {
                    gen,
                    lsn: lsn.to_u64(),
                    bytes,
                })?;
                sent += 1;
            }
        }
        let mut st = self.state.lock();
        st.shipped = st.shipped.max(from);
        st.stats.records_shipped += sent;
        Ok(())
    }

    fn on_ack(&self, from: SiteId, gen: u32, lsn: Lsn) {
        let mut st = self.state.lock();
        if st.role != Role::Master || gen != st.gen {
            return;
        }
        let acked = st.acks.entry(from).or_insert(Lsn::ZERO);
        *acked = (*acked).max(lsn);
        st.stats.acks_received += 1;
        drop(st);
        self.changed.notify_all();
    }

    fn on_log_request(&self, from: SiteId, gen: u32, start: Lsn) -> ReplResult<()> {
        let my_gen = {
            let st = self.state.lock();
            if st.role != Role::Master {
                return Ok(());
            }
            st.gen
        };
        if gen < my_gen {
            self.send(from, &Message::NewMaster { gen: my_gen, site: self.me() });
            return Ok(());
        }
        let mut at = start;
        let mut sent = 0u64;
        loop {
            let batch = self.env.read_log_raw(at, self.config.request_batch)?;
            if batch.is_empty() {
                break;
            }
            for (lsn, bytes) in batch {
                at = record_end(lsn, bytes.len());
                self.transport.send(
                    from,
                    &Message::Log {
                        gen: my_gen,
                        lsn: lsn.to_u64(),
                        bytes,
                    },
                )?;
                sent += 1;
            }
        }
        tracing::debug!(site = self.me(), to = from, %start, records = sent, "answered log request");
        self.state.lock().stats.records_shipped += sent;
        Ok(())
    }

    fn on_verify_request(&self, from: SiteId, gen: u32, lsn: Lsn) {
        let my_gen = {
            let st = self.state.lock();
            if st.role != Role::Master {
                return;
            }
            st.gen
        };
        let bytes = self
            .env
            .read_log_raw(lsn, 1)
            .ok()
            .and_then(|records| records.into_iter().next())
            .filter(|(at, _)| *at == lsn)
            .map(|(_, bytes)| bytes);
        if gen != my_gen {
            tracing::debug!(site = self.me(), to = from, gen, my_gen, "verify from another generation");
        }
        self.send(
            from,
            &Message::VerifyReply {
                gen: my_gen,
                lsn: lsn.to_u64(),
                bytes,
            },
        );
    }

    // ---- client side ----

    fn on_log(&self, from: SiteId, gen: u32, lsn: Lsn, bytes: &[u8]) -> ReplResult<()> {
        let (role, my_gen, master) = {
            let st = self.state.lock();
            (st.role, st.gen, st.master)
        };
        if role == Role::Master {
            if gen < my_gen {
                tracing::info!(site = self.me(), old_master = from, gen, my_gen, "telling stale master");
                self.send(from, &Message::NewMaster { gen: my_gen, site: self.me() });
                return Ok(());
            }
            return self.demote(gen, from);
        }
        if gen < my_gen {
            return Ok(());
        }
        if gen > my_gen || master != Some(from) {
            return self.adopt(gen, from);
        }
        if role == Role::Electing {
            return Ok(());
        }

        let phase_ready = {
            let st = self.state.lock();
            match st.sync {
                SyncPhase::Ready => true,
                SyncPhase::Verifying { .. } => return Ok(()),
                SyncPhase::Unsynced => false,
            }
        };
        if !phase_ready {
            return self.start_sync();
        }

        let end = self.env.end_lsn();
        if lsn >= end && !self.env.log().continues_at(lsn) {
            let mut st = self.state.lock();
            if st.requested != Some(end) {
                st.requested = Some(end);
                st.stats.log_requests += 1;
                drop(st);
                tracing::debug!(site = self.me(), %end, got = %lsn, "log gap, requesting");
                self.send(from, &Message::LogRequest { gen, from: end.to_u64() });
            }
            return Ok(());
        }

        if let Some(applied) = self.env.apply_log_raw(lsn, bytes)? {
            let mut st = self.state.lock();
            st.stats.records_applied += 1;
            drop(st);
            if applied.kind == WalRecordType::Commit {
                self.send(from, &Message::Ack { gen, lsn: lsn.to_u64() });
                self.changed.notify_all();
            }
        }
        Ok(())
    }

    fn on_new_master(&self, from: SiteId, gen: u32, site: SiteId) -> ReplResult<()> {
        if site == self.me() {
            return Ok(());
        }
        let (role, my_gen, master) = {
            let st = self.state.lock();
            (st.role, st.gen, st.master)
        };
        if role == Role::Master {
            if gen >= my_gen {
                return self.demote(gen, site);
            }
            tracing::info!(site = self.me(), old_master = from, gen, my_gen, "telling stale master");
            self.send(from, &Message::NewMaster { gen: my_gen, site: self.me() });
            return Ok(());
        }
        if gen < my_gen || (gen == my_gen && master == Some(site) && role == Role::Client) {
            return Ok(());
        }
        self.adopt(gen, site)
    }

    /// A master that meets another master of the same or a newer
    /// generation stops taking writes and follows it.
    fn demote(&self, gen: u32, master: SiteId) -> ReplResult<()> {
        {
            let mut st = self.state.lock();
            tracing::warn!(
                site = self.me(),
                other = master,
                gen,
                my_gen = st.gen,
                "duplicate master, demoting"
            );
            st.stats.duplicate_masters += 1;
            st.demoted = true;
            st.acks.clear();
        }
        self.env.set_write_gate(WriteGate::DuplicateMaster { generation: gen });
        self.changed.notify_all();
        self.adopt(gen, master)
    }

    fn adopt(&self, gen: u32, master: SiteId) -> ReplResult<()> {
        let demoted = {
            let mut st = self.state.lock();
            if st.election.is_some() || st.role == Role::Electing {
                let votes = st.election.as_ref().map_or(0, |e| e.votes.len());
                let egen = st.egen.max(gen);
                st.decided = Some((egen, Decision::Lost { winner: master, votes }));
            }
            st.role = Role::Client;
            st.gen = gen;
            st.egen = st.egen.max(gen);
            st.master = Some(master);
            st.election = None;
            st.await_master_until = None;
            st.sync = SyncPhase::Unsynced;
            st.requested = None;
            st.demoted
        };
        if !demoted {
            self.env.set_write_gate(WriteGate::NotMaster);
        }
        self.changed.notify_all();
        tracing::info!(site = self.me(), master, gen, "following master");
        self.start_sync()
    }

    /// Walks back through local commits, newest first, asking the master
    /// for its record at each position until one matches.
    fn start_sync(&self) -> ReplResult<()> {
        let candidates = self.env.commit_lsns()?;
        self.state.lock().sync = SyncPhase::Verifying {
            candidates,
            asked: Lsn::ZERO,
        };
        self.ask_next()
    }

    fn ask_next(&self) -> ReplResult<()> {
        let (next, gen, master) = {
            let mut st = self.state.lock();
            let next = match &mut st.sync {
                SyncPhase::Verifying { candidates, asked } => {
                    let next = candidates.pop();
                    if let Some(lsn) = next {
                        *asked = lsn;
                    }
                    next
                }
                _ => return Ok(()),
            };
            (next, st.gen, st.master)
        };
        let Some(master) = master else {
            return Ok(());
        };
        match next {
            Some(lsn) => {
                self.send(master, &Message::VerifyRequest { gen, lsn: lsn.to_u64() });
                Ok(())
            }
            None => self.finish_sync(self.env.log().first_lsn()),
        }
    }

    fn on_verify_reply(&self, from: SiteId, gen: u32, lsn: Lsn, theirs: Option<Vec<u8>>) -> ReplResult<()> {
        {
            let st = self.state.lock();
            let waiting = matches!(st.sync, SyncPhase::Verifying { asked, .. } if asked == lsn);
            if !waiting || st.master != Some(from) || st.gen != gen {
                return Ok(());
            }
        }
        let ours = self
            .env
            .read_log_raw(lsn, 1)?
            .into_iter()
            .next()
            .filter(|(at, _)| *at == lsn);
        match (ours, theirs) {
            (Some((_, ours)), Some(theirs)) if ours == theirs => {
                self.finish_sync(record_end(lsn, ours.len()))
            }
            _ => self.ask_next(),
        }
    }

    /// Cuts the local log back to `point` if it runs past it, then asks
    /// the master for everything after it.
    fn finish_sync(&self, point: Lsn) -> ReplResult<()> {
        if point < self.env.end_lsn() {
            if let Err(e) = self.env.rollback_log_to(point, self.config.rollback_wait) {
                self.state.lock().sync = SyncPhase::Unsynced;
                return Err(e.into());
            }
            self.state.lock().stats.rollbacks += 1;
        }
        let end = self.env.end_lsn();
        let (gen, master) = {
            let mut st = self.state.lock();
            st.sync = SyncPhase::Ready;
            st.requested = Some(end);
            st.stats.log_requests += 1;
            (st.gen, st.master)
        };
        self.changed.notify_all();
        tracing::info!(site = self.me(), %point, %end, "synced with master");
        if let Some(master) = master {
            self.send(master, &Message::LogRequest { gen, from: end.to_u64() });
        }
        Ok(())
    }

    // ---- elections ----

    fn join_election(&self, st: &mut State, egen: u32) {
        let deadline = Instant::now() + self.config.election_timeout;
        let mut votes = HashMap::new();
        votes.insert(
            self.me(),
            Vote {
                last_commit: self.env.last_commit_lsn(),
                priority: self.config.priority,
            },
        );
        st.egen = egen;
        st.election = Some(Election { egen, votes, deadline });
        st.await_master_until = None;
        st.role = Role::Electing;
        st.stats.elections += 1;
        self.env.set_write_gate(WriteGate::Electing);
        tracing::info!(site = self.me(), egen, "election started");
    }

    fn cast_vote(&self, egen: u32) {
        self.send_all(&Message::Vote {
            egen,
            last_commit: self.env.last_commit_lsn().to_u64(),
            priority: self.config.priority,
        });
    }

    fn on_vote(&self, from: SiteId, egen: u32, last_commit: Lsn, priority: u32) {
        let joined = {
            let mut st = self.state.lock();
            if st.role == Role::Master || egen < st.egen {
                return;
            }
            let current = st.election.as_ref().map(|e| e.egen);
            let joined = match current {
                Some(e) if e == egen => false,
                None if egen == st.egen => return,
                _ => {
                    self.join_election(&mut st, egen);
                    true
                }
            };
            if let Some(election) = st.election.as_mut() {
                election.votes.insert(from, Vote { last_commit, priority });
            }
            joined
        };
        if joined {
            self.cast_vote(egen);
        }
    }

    /// Decides a due election; a site whose vote wins becomes master.
    fn tick(&self) {
        let now = Instant::now();
        let decision = {
            let mut st = self.state.lock();
            if st.role == Role::Electing && st.election.is_none() {
                if st.await_master_until.is_some_and(|until| now >= until) {
                    tracing::info!(site = self.me(), "no master announced after election");
                    st.role = Role::Client;
                    st.await_master_until = None;
                    drop(st);
                    self.env.set_write_gate(WriteGate::NotMaster);
                    self.changed.notify_all();
                    self.send_all(&Message::MasterQuery);
                }
                return;
            }
            let due = st
                .election
                .as_ref()
                .is_some_and(|e| e.votes.len() >= self.config.nsites || now >= e.deadline);
            if !due {
                return;
            }
            let Some(election) = st.election.take() else {
                return;
            };
            let votes = election.votes.len();
            let decision = if votes < self.config.majority() {
                Decision::NoQuorum { votes }
            } else {
                let best = election
                    .votes
                    .iter()
                    .filter(|(_, v)| v.priority > 0)
                    .max_by_key(|(site, v)| (v.last_commit, v.priority, **site));
                match best {
                    None => Decision::NoElectable,
                    Some((&site, _)) if site == self.me() => Decision::Won { votes },
                    Some((&winner, _)) => Decision::Lost { winner, votes },
                }
            };
            tracing::info!(site = self.me(), egen = election.egen, votes, ?decision, "election decided");
            (election.egen, decision)
        };

        let (egen, decision) = decision;
        let decision = match decision {
            Decision::Won { votes } => match self.become_master(egen) {
                Ok(()) => {
                    self.state.lock().stats.elections_won += 1;
                    Decision::Won { votes }
                }
                Err(e) => {
                    tracing::error!(site = self.me(), egen, error = %e, "promotion failed");
                    Decision::Failed(e.to_string())
                }
            },
            other => other,
        };
        {
            let mut st = self.state.lock();
            match &decision {
                Decision::Won { .. } => {}
                Decision::Lost { .. } => {
                    // Wait for the winner's announcement, with jitter so
                    // sites do not all give up at once.
                    let jitter = rand::thread_rng().gen_range(0..=self.config.election_timeout.as_millis() as u64 / 4);
                    st.await_master_until =
                        Some(now + self.config.election_timeout + Duration::from_millis(jitter));
                }
                _ => {
                    st.role = Role::Client;
                }
            }
            st.decided = Some((egen, decision.clone()));
        }
        if matches!(
            decision,
            Decision::NoQuorum { .. } | Decision::NoElectable | Decision::Failed(_)
        ) {
            self.env.set_write_gate(WriteGate::NotMaster);
        }
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessNetwork;
    use lodedb_core::EnvConfig;

    fn env() -> Arc<Environment> {
        Environment::open_in_memory(EnvConfig::new().page_size(1024).cache_pages(64)).unwrap()
    }

    #[test]
    fn record_end_adds_length() {
        assert_eq!(record_end(Lsn::new(3, 100), 28), Lsn::new(3, 128));
    }

    #[test]
    fn site_starts_as_client() {
        let net = InProcessNetwork::new();
        let env = env();
        let mgr =
            ReplicationManager::start(Arc::clone(&env), Arc::new(net.join(1)), ReplicationConfig::new(1, 1))
                .unwrap();
        assert_eq!(mgr.role(), Role::Client);
        assert_eq!(env.write_gate(), WriteGate::NotMaster);
        assert_eq!(mgr.master(), None);
    }

    #[test]
    fn mismatched_transport_is_rejected() {
        let net = InProcessNetwork::new();
        let err = ReplicationManager::start(env(), Arc::new(net.join(2)), ReplicationConfig::new(1, 2))
            .unwrap_err();
        assert!(matches!(err, ReplError::Config(_)));
    }

    #[test]
    fn single_site_elects_itself() {
        let net = InProcessNetwork::new();
        let env = env();
        let mgr = ReplicationManager::start(
            Arc::clone(&env),
            Arc::new(net.join(1)),
            ReplicationConfig::new(1, 1).with_election_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let outcome = mgr.hold_election().unwrap();
        assert_eq!(outcome.winner, 1);
        assert_eq!(outcome.votes, 1);
        assert_eq!(mgr.role(), Role::Master);
        assert_eq!(mgr.generation(), outcome.generation);
        assert_eq!(env.write_gate(), WriteGate::Open);
        assert_eq!(mgr.stats().elections_won, 1);
    }

    #[test]
    fn master_cannot_hold_election() {
        let net = InProcessNetwork::new();
        let mgr = ReplicationManager::start(env(), Arc::new(net.join(1)), ReplicationConfig::new(1, 1)).unwrap();
        mgr.start_master().unwrap();
        assert!(matches!(mgr.hold_election(), Err(ReplError::WrongRole { .. })));
    }

    #[test]
    fn zero_priority_site_cannot_win_alone() {
        let net = InProcessNetwork::new();
        let mgr = ReplicationManager::start(
            env(),
            Arc::new(net.join(1)),
            ReplicationConfig::new(1, 1)
                .with_priority(0)
                .with_election_timeout(Duration::from_millis(100)),
        )
        .unwrap();
        assert!(matches!(
            mgr.hold_election(),
            Err(ReplError::NoElectableSite { .. })
        ));
        assert_eq!(mgr.role(), Role::Client);
    }

    #[test]
    fn election_without_quorum_fails() {
        let net = InProcessNetwork::new();
        let _peer = net.join(2);
        net.isolate(2);
        let mgr = ReplicationManager::start(
            env(),
            Arc::new(net.join(1)),
            ReplicationConfig::new(1, 3).with_election_timeout(Duration::from_millis(100)),
        )
        .unwrap();
        let err = mgr.hold_election().unwrap_err();
        assert!(matches!(err, ReplError::ElectionFailed { votes: 1, needed: 2, .. }), "{err}");
        assert!(err.is_retryable());
    }

    #[test]
    fn shutdown_detaches() {
        let net = InProcessNetwork::new();
        let env = env();
        let mgr =
            ReplicationManager::start(Arc::clone(&env), Arc::new(net.join(1)), ReplicationConfig::new(1, 1))
                .unwrap();
        mgr.shutdown();
        assert!(matches!(mgr.start_master(), Err(ReplError::Shutdown)));
        mgr.shutdown();
    }
}
