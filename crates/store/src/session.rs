use crate::connection::{Connection, DriveOutcome};
use crate::error::StoreError;
use crate::pool::ReplicaPool;
use crate::resp::{Command, Reply};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Invoked with the reply to a command (or the reason there is none).
///
/// The callback may return follow-up requests, which are queued and driven
/// within the same [`Session::wait`] call.
pub(crate) type ReplyCallback = Box<dyn FnOnce(Result<Reply, StoreError>) -> Vec<Request> + Send>;

/// A command addressed to one server, with its reply callback.
pub(crate) struct Request {
    pub server: usize,
    pub command: Command,
    pub callback: ReplyCallback,
}

impl Request {
    pub(crate) fn new<F>(server: usize, command: Command, callback: F) -> Self
    where
        F: FnOnce(Result<Reply, StoreError>) -> Vec<Request> + Send + 'static,
    {
        Self {
            server,
            command,
            callback: Box::new(callback),
        }
    }
}

/// The set of replica connections used by one batch (or one read), plus the
/// callbacks of every command in flight on them.
///
/// Sessions are never shared: each batch owns its own.
pub(crate) struct Session {
    pool: Arc<ReplicaPool>,
    connections: BTreeMap<usize, Connection>,
    /// Servers that could not be reached.  We do not retry them within the
    /// session.
    unreachable: BTreeSet<usize>,
    callbacks: BTreeMap<usize, VecDeque<ReplyCallback>>,
}

impl Session {
    pub(crate) fn new(pool: Arc<ReplicaPool>) -> Self {
        Self {
            pool,
            connections: BTreeMap::new(),
            unreachable: BTreeSet::new(),
            callbacks: BTreeMap::new(),
        }
    }

    /// Connects to every replica of `shard` we have not tried yet and returns
    /// the number of replicas with a live connection.
    pub(crate) async fn connect_shard(&mut self, shard: usize) -> usize {
        let servers: Vec<usize> = self
            .pool
            .replicas_of(shard)
            .filter(|server| {
                !self.connections.contains_key(server) && !self.unreachable.contains(server)
            })
            .collect();

        let timeout = self.pool.connect_timeout();
        let attempts = servers.iter().map(|server| {
            let config = self.pool.server(*server).clone();
            async move { Connection::connect(&config, timeout).await }
        });
        let results = join_all(attempts).await;

        for (server, result) in servers.into_iter().zip(results) {
            match result {
                Ok(connection) => {
                    self.connections.insert(server, connection);
                }
                Err(error) => {
                    warn!(shard, server, "replica is unreachable: {error}");
                    self.unreachable.insert(server);
                }
            }
        }
        self.reachable(shard)
    }

    /// Number of replicas of `shard` with a live connection.
    pub(crate) fn reachable(&self, shard: usize) -> usize {
        self.pool
            .replicas_of(shard)
            .filter(|server| {
                self.connections
                    .get(server)
                    .is_some_and(|connection| connection.is_connected())
            })
            .count()
    }

    /// Queues `request` on its server's connection.
    ///
    /// A request for a server without a live connection is answered right
    /// away with [`StoreError::Disconnected`].
    pub(crate) fn submit(&mut self, request: Request) {
        let mut queue = VecDeque::from([request]);
        while let Some(request) = queue.pop_front() {
            match self.connections.get_mut(&request.server) {
                Some(connection) if connection.is_connected() => {
                    connection.enqueue(&request.command);
                    self.callbacks
                        .entry(request.server)
                        .or_default()
                        .push_back(request.callback);
                }
                _ => {
                    let server = self.pool.server(request.server).address();
                    trace!(%server, "dropping {} for dead replica", request.command.name());
                    queue.extend((request.callback)(Err(StoreError::Disconnected { server })));
                }
            }
        }
    }

    fn pending(&self) -> usize {
        self.callbacks.values().map(VecDeque::len).sum()
    }

    /// Runs the I/O loop until every queued command has been answered.
    ///
    /// Callbacks run on this thread as soon as their connection's replies
    /// are in.  Requests they return are sent in the next round, so the loop
    /// keeps going until no callback adds more work or `timeout` elapses.
    /// On timeout, every command still waiting for a reply fails with
    /// [`StoreError::Timeout`].
    pub(crate) async fn wait(&mut self, timeout: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            let mut drives: FuturesUnordered<_> = self
                .connections
                .iter_mut()
                .filter(|(_, connection)| connection.in_flight() > 0)
                .map(|(server, connection)| async move { (*server, connection.drive().await) })
                .collect();
            if drives.is_empty() {
                return Ok(());
            }

            let mut outcomes = Vec::with_capacity(drives.len());
            let timed_out = loop {
                match tokio::time::timeout_at(deadline, drives.next()).await {
                    Ok(Some(outcome)) => outcomes.push(outcome),
                    Ok(None) => break false,
                    Err(_) => break true,
                }
            };
            drop(drives);

            let mut follow_ups = Vec::new();
            for (server, outcome) in outcomes {
                follow_ups.extend(self.complete(server, outcome));
            }

            if timed_out {
                let busy: Vec<usize> = self
                    .connections
                    .iter()
                    .filter(|(_, connection)| connection.in_flight() > 0)
                    .map(|(server, _)| *server)
                    .collect();
                let pending = self.pending();
                for server in busy {
                    if let Some(connection) = self.connections.get_mut(&server) {
                        connection.mark_disconnecting();
                    }
                    for callback in self.callbacks.remove(&server).unwrap_or_default() {
                        // Follow-ups are dropped: there is no time left to send them.
                        let _ = callback(Err(StoreError::Timeout { pending }));
                    }
                }
                return Err(StoreError::Timeout { pending });
            }

            for request in follow_ups {
                self.submit(request);
            }
        }
    }

    /// Hands the replies in `outcome` to the callbacks waiting on `server`.
    fn complete(&mut self, server: usize, outcome: DriveOutcome) -> Vec<Request> {
        let mut follow_ups = Vec::new();
        let Some(callbacks) = self.callbacks.get_mut(&server) else {
            return follow_ups;
        };
        for reply in outcome.replies {
            if let Some(callback) = callbacks.pop_front() {
                follow_ups.extend(callback(Ok(reply)));
            }
        }
        if let Some(error) = outcome.error {
            for callback in callbacks.drain(..) {
                follow_ups.extend(callback(Err(error.clone())));
            }
        }
        follow_ups
    }
}
