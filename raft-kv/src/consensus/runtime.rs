//! Worker runtime for the raft node.
//!
//! One worker thread owns the [`RaftNode`] and multiplexes three event
//! sources with `crossbeam_channel::select!`:
//!
//! - client requests arriving through a [`RaftHandle`]
//! - raft messages from the network listener
//! - the logical clock tick
//!
//! Callers never touch raft state directly. Every request carries a tokio
//! oneshot the worker answers once the outcome is known, so async request
//! handlers can await commits without blocking their executor.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::future::{BoxFuture, FutureExt};
use raft::prelude::Message;
use raft::StateRole;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::log_db::LogDb;
use super::node::{AppliedEntry, AppliedKind, RaftNode};
use super::snapshot_store::FileSnapshotStore;
use super::transport::{self, Inbound, Listener, Transport};
use super::{member_id, ApplyReport, Consensus, StateMachine};
use crate::error::ConsensusError;
use crate::leadership::{leadership_channel, LeadershipNotifier};

/// Settings for one raft member.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Address raft peers reach this node on. Doubles as its identity.
    pub address: String,
    /// Directory for the raft log and snapshots.
    pub data_dir: PathBuf,
    /// Start a new single-voter cluster when no local state exists.
    pub bootstrap: bool,
    pub snapshot_interval: Duration,
    /// Minimum number of entries applied since the last snapshot before a
    /// new one is taken.
    pub snapshot_threshold: u64,
    pub retain_snapshots: usize,
    /// Raft logical clock interval.
    pub tick_interval: Duration,
}

impl RaftConfig {
    pub fn new(address: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            data_dir: data_dir.into(),
            bootstrap: false,
            snapshot_interval: Duration::from_secs(20),
            snapshot_threshold: 2,
            retain_snapshots: 2,
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Point-in-time view of the node, for logs and diagnostics.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: u64,
    pub address: String,
    pub role: StateRole,
    pub leader_id: u64,
    pub term: u64,
    pub applied_index: u64,
    pub members: BTreeMap<u64, String>,
}

enum Request {
    Apply {
        command: Vec<u8>,
        respond_to: oneshot::Sender<Result<ApplyReport, ConsensusError>>,
    },
    AddVoter {
        node_id: u64,
        address: String,
        prev_index: u64,
        respond_to: oneshot::Sender<Result<(), ConsensusError>>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Cheap, cloneable handle to a running node.
#[derive(Clone)]
pub struct RaftHandle {
    id: u64,
    address: String,
    requests: Sender<Request>,
}

impl RaftHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Raft address this node announces to its peers.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn status(&self) -> Result<NodeStatus, ConsensusError> {
        let (respond_to, rx) = oneshot::channel();
        self.requests
            .send(Request::Status { respond_to })
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)
    }

    /// Stops the worker. Outstanding requests fail with
    /// [`ConsensusError::Shutdown`] and the leadership channel closes.
    pub fn shutdown(&self) {
        if self.requests.send(Request::Shutdown).is_err() {
            debug!("raft worker already stopped");
        }
    }
}

impl Consensus for RaftHandle {
    fn apply(
        &self,
        command: Vec<u8>,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<ApplyReport, ConsensusError>> {
        let (respond_to, rx) = oneshot::channel();
        let sent = self.requests.send(Request::Apply {
            command,
            respond_to,
        });
        async move {
            sent.map_err(|_| ConsensusError::Shutdown)?;
            wait_for(rx, timeout).await?
        }
        .boxed()
    }

    fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<(), ConsensusError>> {
        let (respond_to, rx) = oneshot::channel();
        let sent = self.requests.send(Request::AddVoter {
            node_id: member_id(id),
            address: address.to_string(),
            prev_index,
            respond_to,
        });
        async move {
            sent.map_err(|_| ConsensusError::Shutdown)?;
            wait_for(rx, timeout).await?
        }
        .boxed()
    }
}

async fn wait_for<T>(rx: oneshot::Receiver<T>, timeout: Duration) -> Result<T, ConsensusError> {
    let outcome = if timeout.is_zero() {
        rx.await
    } else {
        tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| ConsensusError::Timeout(timeout))?
    };
    outcome.map_err(|_| ConsensusError::Shutdown)
}

/// Starts a raft member and returns a handle plus its leadership
/// notifications.
///
/// Local state, if any, is recovered first: the newest snapshot plus the
/// durable raft log. `bootstrap` only takes effect when there is none. The
/// notification receiver closes once the worker has stopped and released
/// its log and listener.
pub fn spawn_node(
    config: RaftConfig,
    fsm: Arc<dyn StateMachine>,
) -> Result<(RaftHandle, Receiver<bool>)> {
    let snapshots = FileSnapshotStore::open(config.data_dir.join("snapshots"), config.retain_snapshots)
        .with_context(|| format!("failed to open snapshot store in {}", config.data_dir.display()))?;
    let db = LogDb::open(&config.data_dir.join(LOG_FILE))?;

    let requested = match db.address()? {
        Some(saved) if saved == config.address => saved,
        Some(saved) if is_wildcard_port(&config.address) => {
            info!(address = %saved, "reusing raft address from previous run");
            saved
        }
        Some(saved) => {
            warn!(
                previous = %saved,
                configured = %config.address,
                "raft address changed, member id changes with it"
            );
            config.address.clone()
        }
        None => config.address.clone(),
    };

    let (network_tx, network_rx) = unbounded();
    let listener = transport::listen(&requested, network_tx)?;
    let address = advertised_address(&requested, listener.local_addr());

    let mut node = RaftNode::open(&address, fsm, db, snapshots, config.bootstrap)?;
    if node.bootstrapped() {
        node.campaign()?;
    }
    let id = node.id();

    let (request_tx, request_rx) = unbounded();
    let (notifier, leadership_rx) = leadership_channel();
    let mut worker = Worker {
        node,
        transport: Transport::new(address.clone()),
        _listener: listener,
        requests: request_rx,
        inbound: network_rx,
        learned: HashMap::new(),
        pending: BTreeMap::new(),
        was_leader: false,
        last_role: StateRole::Follower,
        tick_interval: config.tick_interval,
        snapshot_interval: config.snapshot_interval,
        snapshot_threshold: config.snapshot_threshold,
        leadership: notifier,
    };

    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                error!(error = ?err, "raft worker stopped");
            }
        })
        .context("failed to spawn raft worker")?;

    info!(id, %address, "raft node started");
    Ok((
        RaftHandle {
            id,
            address,
            requests: request_tx,
        },
        leadership_rx,
    ))
}

const LOG_FILE: &str = "raft.db";

fn is_wildcard_port(address: &str) -> bool {
    address
        .parse::<SocketAddr>()
        .map_or(false, |addr| addr.port() == 0)
}

/// The identity must be an address peers can dial, so a wildcard port is
/// replaced by the one actually bound.
fn advertised_address(requested: &str, bound: SocketAddr) -> String {
    match requested.parse::<SocketAddr>() {
        Ok(addr) if addr.port() == 0 => bound.to_string(),
        _ => requested.to_string(),
    }
}

/// A submission waiting for its log entry to apply.
enum Proposal {
    Apply {
        term: u64,
        respond_to: oneshot::Sender<Result<ApplyReport, ConsensusError>>,
    },
    AddVoter {
        term: u64,
        node_id: u64,
        respond_to: oneshot::Sender<Result<(), ConsensusError>>,
    },
}

impl Proposal {
    /// Resolves against the entry that was applied at the proposal's index.
    /// A different term means another leader overwrote the slot.
    fn complete(self, entry: &AppliedEntry) {
        match self {
            Proposal::Apply { term, respond_to } => {
                let outcome = if entry.term != term {
                    Err(ConsensusError::LeadershipLost)
                } else if entry.kind != AppliedKind::Command {
                    Err(ConsensusError::Dropped)
                } else {
                    Ok(ApplyReport {
                        index: entry.index,
                        term: entry.term,
                    })
                };
                let _ = respond_to.send(outcome);
            }
            Proposal::AddVoter {
                term,
                node_id,
                respond_to,
            } => {
                let outcome = match &entry.kind {
                    _ if entry.term != term => Err(ConsensusError::LeadershipLost),
                    AppliedKind::Membership { node_id: added, .. } if *added == node_id => Ok(()),
                    _ => Err(ConsensusError::Dropped),
                };
                let _ = respond_to.send(outcome);
            }
        }
    }

    fn fail(self, err: ConsensusError) {
        match self {
            Proposal::Apply { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            Proposal::AddVoter { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
        }
    }
}

struct Worker {
    node: RaftNode,
    transport: Transport,
    _listener: Listener,
    requests: Receiver<Request>,
    inbound: Receiver<Inbound>,
    /// Addresses announced by peers that are not (yet) in the configuration.
    learned: HashMap<u64, String>,
    /// Outstanding proposals keyed by the log index they were assigned.
    pending: BTreeMap<u64, Proposal>,
    was_leader: bool,
    last_role: StateRole,
    tick_interval: Duration,
    snapshot_interval: Duration,
    snapshot_threshold: u64,
    /// Declared last so it drops last: a closed leadership channel means the
    /// log and the listener are already released.
    leadership: LeadershipNotifier,
}

impl Worker {
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        let mut last_snapshot = Instant::now();
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.requests) -> req => {
                    match req {
                        Ok(Request::Shutdown) | Err(_) => break,
                        Ok(req) => self.handle_request(req),
                    }
                }
                recv(self.inbound) -> msg => {
                    match msg {
                        Ok(inbound) => self.handle_inbound(inbound),
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.track_leadership();

            if last_snapshot.elapsed() >= self.snapshot_interval {
                self.maybe_snapshot();
                last_snapshot = Instant::now();
            }
        }

        info!(id = self.node.id(), "raft worker shutting down");
        self.fail_pending(|| ConsensusError::Shutdown);
        Ok(())
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Apply {
                command,
                respond_to,
            } => {
                if !self.node.is_leader() {
                    let leader_id = self.node.leader_id();
                    let _ = respond_to.send(Err(ConsensusError::NotLeader { leader_id }));
                    return;
                }
                match self.node.propose(command) {
                    Ok((index, term)) => {
                        self.pending
                            .insert(index, Proposal::Apply { term, respond_to });
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err.into()));
                    }
                }
            }
            Request::AddVoter {
                node_id,
                address,
                prev_index,
                respond_to,
            } => {
                if let Err(err) = self.check_add_voter(node_id, &address, prev_index) {
                    let _ = respond_to.send(Err(err));
                    return;
                }
                if self.node.member_address(node_id).as_deref() == Some(address.as_str()) {
                    debug!(node_id, %address, "already a voter");
                    let _ = respond_to.send(Ok(()));
                    return;
                }
                match self.node.propose_add_voter(node_id, &address) {
                    Ok((index, term)) => {
                        info!(node_id, %address, index, "proposed adding voter");
                        self.learned.insert(node_id, address);
                        self.pending.insert(
                            index,
                            Proposal::AddVoter {
                                term,
                                node_id,
                                respond_to,
                            },
                        );
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err.into()));
                    }
                }
            }
            Request::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            Request::Shutdown => {}
        }
    }

    fn check_add_voter(&self, node_id: u64, address: &str, prev_index: u64) -> Result<(), ConsensusError> {
        if !self.node.is_leader() {
            return Err(ConsensusError::NotLeader {
                leader_id: self.node.leader_id(),
            });
        }
        let actual = self.node.config_index();
        if prev_index != 0 && prev_index != actual {
            warn!(node_id, address, prev_index, actual, "stale configuration index");
            return Err(ConsensusError::ConfigurationChanged {
                expected: prev_index,
                actual,
            });
        }
        Ok(())
    }

    fn status(&self) -> NodeStatus {
        let id = self.node.id();
        NodeStatus {
            id,
            address: self.node.member_address(id).unwrap_or_default(),
            role: self.node.role(),
            leader_id: self.node.leader_id(),
            term: self.node.term(),
            applied_index: self.node.applied_index(),
            members: self.node.members(),
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound { from, message } = inbound;
        self.learned.insert(member_id(&from), from);
        if let Err(err) = self.node.step(message) {
            debug!(error = %err, "ignoring raft message");
        }
    }

    /// Drains every ready state, dispatching messages and resolving
    /// proposals.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg);
            }
            for entry in bundle.applied {
                if let Some(proposal) = self.pending.remove(&entry.index) {
                    proposal.complete(&entry);
                }
            }
            // Anything still pending at or below the applied index was
            // skipped, e.g. by installing a snapshot.
            let applied = self.node.applied_index();
            while let Some(entry) = self.pending.first_entry() {
                if *entry.key() > applied {
                    break;
                }
                entry.remove().fail(ConsensusError::Dropped);
            }
        }
        Ok(())
    }

    fn dispatch_message(&mut self, msg: Message) {
        if msg.to == self.node.id() {
            if let Err(err) = self.node.step(msg) {
                debug!(error = %err, "failed to step local message");
            }
            return;
        }
        let to = msg.to;
        let address = self
            .node
            .member_address(to)
            .or_else(|| self.learned.get(&to).cloned());
        match address {
            Some(address) => self.transport.send(&address, msg),
            None => debug!(to, "no address for peer, dropping message"),
        }
    }

    /// Publishes leadership flips and fails proposals a deposed leader can
    /// no longer vouch for.
    fn track_leadership(&mut self) {
        let role = self.node.role();
        if role != self.last_role {
            info!(
                id = self.node.id(),
                from = ?self.last_role,
                to = ?role,
                leader = self.node.leader_id(),
                term = self.node.term(),
                "role changed"
            );
            self.last_role = role;
        }

        let is_leader = role == StateRole::Leader;
        if is_leader != self.was_leader {
            self.was_leader = is_leader;
            self.leadership.notify(is_leader);
            if !is_leader {
                self.fail_pending(|| ConsensusError::LeadershipLost);
            }
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> ConsensusError) {
        for (_, proposal) in std::mem::take(&mut self.pending) {
            proposal.fail(err());
        }
    }

    fn maybe_snapshot(&mut self) {
        let fresh = self
            .node
            .applied_index()
            .saturating_sub(self.node.snapshot_index());
        if fresh < self.snapshot_threshold {
            return;
        }
        match self.node.take_snapshot() {
            Ok(meta) => info!(id = %meta.id, index = meta.index, "snapshot taken"),
            Err(err) => warn!(error = ?err, "snapshot failed, retrying next interval"),
        }
    }
}
