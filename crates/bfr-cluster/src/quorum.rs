use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;

use bfr_types::{
    BfrError, DatabaseName, NodeId, OpId, OpResponse, Operation, Quorum, Record, RecordId,
    RecordVersion,
};

use crate::config::ServerRole;
use crate::transport::{Request, Response, Transport};

/// A replica a write is sent to, with the role it plays for the database.
pub type WriteTarget = (NodeId, ServerRole);

/// A write waiting for acknowledgments. Lives for the duration of one
/// [`QuorumCoordinator::propose`] call.
#[derive(Debug)]
pub struct PendingOperation {
    pub id: OpId,
    pub database: DatabaseName,
    pub required: usize,
    pub targets: Vec<NodeId>,
    /// Targets whose acknowledgments count toward `required`.
    pub voters: HashSet<NodeId>,
    pub deadline: Instant,
    acks: Vec<(NodeId, OpResponse)>,
    failures: Vec<(NodeId, BfrError)>,
}

impl PendingOperation {
    fn new(
        database: &str,
        op: &Operation,
        targets: &[WriteTarget],
        required: usize,
        deadline: Instant,
    ) -> Self {
        PendingOperation {
            id: op.id,
            database: database.to_string(),
            required,
            targets: targets.iter().map(|(node, _)| node.clone()).collect(),
            voters: targets
                .iter()
                .filter(|(_, role)| *role == ServerRole::Master)
                .map(|(node, _)| node.clone())
                .collect(),
            deadline,
            acks: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn record(&mut self, node: NodeId, reply: Result<OpResponse, BfrError>) {
        match reply {
            Ok(ack) => self.acks.push((node, ack)),
            Err(e) => self.failures.push((node, e)),
        }
    }

    fn answered(&self, node: &str) -> bool {
        self.acks.iter().any(|(n, _)| n == node) || self.failures.iter().any(|(n, _)| n == node)
    }

    /// Acknowledgments from voters.
    pub fn received(&self) -> usize {
        self.acks
            .iter()
            .filter(|(node, _)| self.voters.contains(node))
            .count()
    }

    pub fn outstanding(&self) -> usize {
        self.targets.len() - self.acks.len() - self.failures.len()
    }

    fn outstanding_voters(&self) -> usize {
        self.voters.iter().filter(|v| !self.answered(v)).count()
    }

    pub fn is_reached(&self) -> bool {
        self.received() >= self.required
    }

    /// `false` once the voters still missing cannot make up the quorum.
    pub fn is_reachable(&self) -> bool {
        self.received() + self.outstanding_voters() >= self.required
    }

    fn outcome(self) -> Result<OpResponse, BfrError> {
        let received = self.received();
        if received >= self.required {
            // Replicas agree on the version; take the highest to be safe.
            let best = self
                .acks
                .into_iter()
                .max_by_key(|(_, ack)| ack.version().version);
            if let Some((_, ack)) = best {
                return Ok(ack);
            }
        }
        let failures = self.failures;
        let pick = |pred: fn(&BfrError) -> bool| {
            failures
                .iter()
                .map(|(_, e)| e)
                .find(|e| pred(*e))
                .cloned()
        };
        if let Some(e) = pick(|e| matches!(e, BfrError::Conflict { .. })) {
            return Err(e);
        }
        let final_rejection =
            pick(|e| matches!(e, BfrError::DuplicateKey { .. } | BfrError::NotFound(_)));
        if let Some(e) = final_rejection {
            return Err(e);
        }
        if let Some(e) = pick(|e| matches!(e, BfrError::ReplicaBehind { .. })) {
            return Err(e);
        }
        Err(BfrError::QuorumNotReached { required: self.required, received })
    }
}

fn into_ack(reply: Result<Response, BfrError>) -> Result<OpResponse, BfrError> {
    match reply?.into_result()? {
        Response::Ack(ack) => Ok(ack),
        other => Err(BfrError::Storage(format!(
            "unexpected reply to replicate: {other:?}"
        ))),
    }
}

/// Fans writes out to replicas and gathers acknowledgments under a quorum.
pub struct QuorumCoordinator<T> {
    local: NodeId,
    transport: Arc<T>,
    timeout: Duration,
    max_auto_retry: u32,
    backoff: Duration,
}

impl<T: Transport> QuorumCoordinator<T> {
    pub fn new(
        local: NodeId,
        transport: Arc<T>,
        timeout: Duration,
        max_auto_retry: u32,
        backoff: Duration,
    ) -> Self {
        QuorumCoordinator {
            local,
            transport,
            timeout,
            max_auto_retry,
            backoff,
        }
    }

    /// Send `op` to every target and wait for `quorum` acknowledgments from
    /// the master targets.
    ///
    /// Sends are detached: a timed-out or aborted proposal still lets every
    /// replica apply the operation, and replicas that applied are not rolled
    /// back.
    pub async fn propose(
        &self,
        database: &str,
        op: Operation,
        targets: Vec<WriteTarget>,
        quorum: Quorum,
    ) -> Result<OpResponse, BfrError> {
        if targets.is_empty() {
            return Err(BfrError::DatabaseNotOnline {
                database: database.to_string(),
                node: None,
            });
        }
        let masters = targets
            .iter()
            .filter(|(_, role)| *role == ServerRole::Master)
            .count();
        let required = quorum.resolve(masters);
        if required > masters {
            return Err(BfrError::QuorumNotReached { required, received: 0 });
        }

        let deadline = Instant::now() + self.timeout;
        let mut pending = PendingOperation::new(database, &op, &targets, required, deadline);
        let (tx, mut rx) = mpsc::channel(targets.len());
        for (node, _) in targets {
            let transport = self.transport.clone();
            let local = self.local.clone();
            let request = Request::Replicate {
                database: database.to_string(),
                op: op.clone(),
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = transport.send(&local, &node, request).await;
                // The coordinator may have stopped listening.
                let _ = tx.send((node, into_ack(reply))).await;
            });
        }
        drop(tx);

        if required == 0 {
            tracing::debug!(database, op = %op.id, "fire-and-forget write sent");
            let version = RecordVersion {
                record: op.record().clone(),
                version: op.expected_version() + 1,
            };
            return Ok(OpResponse::Written(version));
        }

        while pending.outstanding() > 0 && !pending.is_reached() && pending.is_reachable() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((node, reply))) => {
                    if let Err(e) = &reply {
                        tracing::debug!(
                            database,
                            op = %op.id,
                            node = %node,
                            error = %e,
                            "replica rejected write"
                        );
                    }
                    pending.record(node, reply);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        database,
                        op = %op.id,
                        required,
                        received = pending.received(),
                        "quorum wait timed out"
                    );
                    break;
                }
            }
        }
        pending.outcome()
    }

    /// [`propose`](Self::propose), re-proposing the same operation while
    /// replicas report they are behind.
    ///
    /// `targets` is evaluated before every attempt so that retries see the
    /// current set of online replicas. Once retries are exhausted the
    /// transient conflict is reported as a [`BfrError::Conflict`].
    pub async fn propose_with_retry<F>(
        &self,
        database: &str,
        op: Operation,
        targets: F,
    ) -> Result<OpResponse, BfrError>
    where
        F: Fn() -> Result<(Vec<WriteTarget>, Quorum), BfrError>,
    {
        let mut attempt = 0u32;
        loop {
            let (nodes, quorum) = targets()?;
            match self.propose(database, op.clone(), nodes, quorum).await {
                Err(BfrError::ReplicaBehind { record, expected, actual }) => {
                    if attempt >= self.max_auto_retry {
                        return Err(BfrError::Conflict { record, expected, actual });
                    }
                    attempt += 1;
                    let pause = self.jitter();
                    tracing::debug!(
                        database,
                        op = %op.id,
                        attempt,
                        pause_ms = pause.as_millis() as u64,
                        "retrying write"
                    );
                    tokio::time::sleep(pause).await;
                }
                other => return other,
            }
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.backoff.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(max / 2..=max))
    }

    /// Read a record.
    ///
    /// With a read quorum of one, targets are tried in order until one that
    /// is reachable and online answers. Larger quorums collect that many
    /// answers and keep the highest version.
    pub async fn read(
        &self,
        database: &str,
        record: &RecordId,
        targets: Vec<NodeId>,
        quorum: Quorum,
    ) -> Result<Option<Record>, BfrError> {
        let not_online = || BfrError::DatabaseNotOnline {
            database: database.to_string(),
            node: None,
        };
        if targets.is_empty() {
            return Err(not_online());
        }
        let required = quorum.resolve(targets.len()).max(1);
        if required > targets.len() {
            return Err(BfrError::QuorumNotReached { required, received: 0 });
        }
        let request = Request::Read {
            database: database.to_string(),
            record: record.clone(),
        };

        if required == 1 {
            let mut last = None;
            for node in targets {
                let send = self.transport.send(&self.local, &node, request.clone());
                let reply = tokio::time::timeout(self.timeout, send)
                    .await
                    .unwrap_or(Err(BfrError::Timeout));
                match into_record(reply) {
                    Ok(r) => return Ok(r),
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(database, node = %node, error = %e, "read rerouted");
                        last = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            return Err(last.unwrap_or_else(not_online));
        }

        let (tx, mut rx) = mpsc::channel(targets.len());
        let total = targets.len();
        for node in targets {
            let transport = self.transport.clone();
            let local = self.local.clone();
            let request = request.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = transport.send(&local, &node, request).await;
                let _ = tx.send(into_record(reply)).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout;
        let mut answers: Vec<Option<Record>> = Vec::new();
        let mut failed = 0;
        while answers.len() < required && total - failed >= required {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Ok(r))) => answers.push(r),
                Ok(Some(Err(e))) if e.is_retryable() => failed += 1,
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) | Err(_) => break,
            }
        }
        if answers.len() < required {
            return Err(BfrError::QuorumNotReached {
                required,
                received: answers.len(),
            });
        }
        Ok(answers
            .into_iter()
            .max_by_key(|r| r.as_ref().map_or(0, |r| r.version))
            .flatten())
    }
}

fn into_record(reply: Result<Response, BfrError>) -> Result<Option<Record>, BfrError> {
    match reply?.into_result()? {
        Response::Record(r) => Ok(r),
        other => Err(BfrError::Storage(format!("unexpected reply to read: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Behavior {
        Ack,
        Reject(BfrError),
        /// Reject this many times, then ack.
        BehindFor(usize),
        Unreachable,
        Slow(Duration),
        Holds(Option<u64>),
    }

    struct Scripted {
        behaviors: HashMap<NodeId, Behavior>,
        calls: AtomicUsize,
        delivered: parking_lot::Mutex<Vec<NodeId>>,
    }

    impl Scripted {
        fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Scripted {
                behaviors: behaviors
                    .iter()
                    .map(|(n, b)| (n.to_string(), b.clone()))
                    .collect(),
                calls: AtomicUsize::new(0),
                delivered: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for Scripted {
        async fn send(
            &self,
            _from: &str,
            to: &str,
            request: Request,
        ) -> Result<Response, BfrError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self
                .behaviors
                .get(to)
                .cloned()
                .unwrap_or(Behavior::Unreachable);
            if let Behavior::Slow(d) = behavior {
                tokio::time::sleep(d).await;
            }
            let (record, version) = match &request {
                Request::Replicate { op, .. } => (op.record().clone(), op.expected_version()),
                Request::Read { record, .. } => (record.clone(), 0),
                _ => unreachable!(),
            };
            let ack = Response::Ack(OpResponse::Written(RecordVersion {
                record: record.clone(),
                version: version + 1,
            }));
            let reply = match behavior {
                Behavior::Ack | Behavior::Slow(_) => ack,
                Behavior::Reject(e) => Response::Error(e),
                Behavior::BehindFor(n) if call < n => Response::Error(BfrError::ReplicaBehind {
                    record,
                    expected: version,
                    actual: version - 1,
                }),
                Behavior::BehindFor(_) => ack,
                Behavior::Unreachable => return Err(BfrError::NodeUnavailable(to.to_string())),
                Behavior::Holds(v) => Response::Record(v.map(|version| Record {
                    id: record,
                    class: "Person".into(),
                    value: to.as_bytes().to_vec(),
                    version,
                    deleted: false,
                    last_op: None,
                })),
            };
            self.delivered.lock().push(to.to_string());
            Ok(reply)
        }
    }

    fn coordinator(transport: Arc<Scripted>, retries: u32) -> QuorumCoordinator<Scripted> {
        QuorumCoordinator::new(
            "a".into(),
            transport,
            Duration::from_millis(200),
            retries,
            Duration::from_millis(10),
        )
    }

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn masters(names: &[&str]) -> Vec<WriteTarget> {
        names
            .iter()
            .map(|s| (s.to_string(), ServerRole::Master))
            .collect()
    }

    fn op() -> Operation {
        Operation::update(RecordId::new("person", "1"), b"v".to_vec(), 1)
    }

    #[tokio::test]
    async fn quorum_reached_with_a_failed_replica() {
        let t = Scripted::new(&[
            ("a", Behavior::Ack),
            ("b", Behavior::Unreachable),
            ("c", Behavior::Ack),
        ]);
        let ack = coordinator(t, 0)
            .propose("db", op(), masters(&["a", "b", "c"]), Quorum::Majority)
            .await
            .unwrap();
        assert_eq!(ack.version().version, 2);
    }

    #[tokio::test]
    async fn quorum_not_reached_aborts_early() {
        let t = Scripted::new(&[
            ("a", Behavior::Ack),
            ("b", Behavior::Unreachable),
            ("c", Behavior::Unreachable),
        ]);
        let err = coordinator(t, 0)
            .propose("db", op(), masters(&["a", "b", "c"]), Quorum::All)
            .await
            .unwrap_err();
        assert!(matches!(err, BfrError::QuorumNotReached { required: 3, .. }));
    }

    #[tokio::test]
    async fn remote_ack_suffices_without_local() {
        let t = Scripted::new(&[
            ("a", Behavior::Unreachable),
            ("b", Behavior::Ack),
            ("c", Behavior::Ack),
        ]);
        let res = coordinator(t, 0)
            .propose("db", op(), masters(&["a", "b", "c"]), Quorum::Count(2))
            .await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn numeric_quorum_above_replica_count_fails_fast() {
        let t = Scripted::new(&[("a", Behavior::Ack)]);
        let err = coordinator(t.clone(), 0)
            .propose("db", op(), masters(&["a"]), Quorum::Count(2))
            .await
            .unwrap_err();
        assert_eq!(err, BfrError::QuorumNotReached { required: 2, received: 0 });
        assert_eq!(t.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn only_masters_count_toward_the_write_quorum() {
        let t = Scripted::new(&[
            ("a", Behavior::Ack),
            ("b", Behavior::Ack),
            ("c", Behavior::Unreachable),
        ]);
        let targets = vec![
            ("a".to_string(), ServerRole::Master),
            ("b".to_string(), ServerRole::Replica),
            ("c".to_string(), ServerRole::Master),
        ];
        let err = coordinator(t.clone(), 0)
            .propose("db", op(), targets, Quorum::All)
            .await
            .unwrap_err();
        assert_eq!(err, BfrError::QuorumNotReached { required: 2, received: 1 });

        // An unreachable replica does not hold back an all-masters quorum.
        let targets = vec![
            ("a".to_string(), ServerRole::Master),
            ("c".to_string(), ServerRole::Replica),
        ];
        let ack = coordinator(t, 0)
            .propose("db", op(), targets, Quorum::All)
            .await
            .unwrap();
        assert_eq!(ack.version().version, 2);
    }

    #[tokio::test]
    async fn replicas_still_receive_writes() {
        let t = Scripted::new(&[
            ("a", Behavior::Ack),
            ("b", Behavior::Slow(Duration::from_millis(50))),
        ]);
        let targets = vec![
            ("a".to_string(), ServerRole::Master),
            ("b".to_string(), ServerRole::Replica),
        ];
        coordinator(t.clone(), 0)
            .propose("db", op(), targets, Quorum::All)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(t.delivered.lock().contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn no_online_master_fails_unless_fire_and_forget() {
        let t = Scripted::new(&[("b", Behavior::Ack)]);
        let targets = vec![("b".to_string(), ServerRole::Replica)];
        let err = coordinator(t.clone(), 0)
            .propose("db", op(), targets.clone(), Quorum::Majority)
            .await
            .unwrap_err();
        assert_eq!(err, BfrError::QuorumNotReached { required: 1, received: 0 });

        let ack = coordinator(t, 0)
            .propose("db", op(), targets, Quorum::Count(0))
            .await
            .unwrap();
        assert_eq!(ack.version().version, 2);
    }

    #[tokio::test]
    async fn timeout_reports_quorum_not_reached_and_late_acks_still_land() {
        let t = Scripted::new(&[
            ("a", Behavior::Ack),
            ("b", Behavior::Slow(Duration::from_millis(400))),
        ]);
        let err = coordinator(t.clone(), 0)
            .propose("db", op(), masters(&["a", "b"]), Quorum::All)
            .await
            .unwrap_err();
        assert_eq!(err, BfrError::QuorumNotReached { required: 2, received: 1 });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(t.delivered.lock().contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn conflict_beats_quorum_failure() {
        let rid = RecordId::new("person", "1");
        let conflict = BfrError::Conflict {
            record: rid,
            expected: 1,
            actual: 2,
        };
        let t = Scripted::new(&[
            ("a", Behavior::Reject(conflict.clone())),
            ("b", Behavior::Reject(conflict.clone())),
        ]);
        let err = coordinator(t, 3)
            .propose_with_retry("db", op(), || Ok((masters(&["a", "b"]), Quorum::Majority)))
            .await;
        assert_eq!(err.unwrap_err(), conflict);
    }

    #[tokio::test]
    async fn transient_conflict_is_retried() {
        // Two replicas behind for the first attempt only.
        let t = Scripted::new(&[("a", Behavior::BehindFor(2)), ("b", Behavior::BehindFor(2))]);
        let ack = coordinator(t.clone(), 2)
            .propose_with_retry("db", op(), || Ok((masters(&["a", "b"]), Quorum::All)))
            .await
            .unwrap();
        assert_eq!(ack.version().version, 2);
        assert_eq!(t.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_conflict() {
        let t = Scripted::new(&[("a", Behavior::BehindFor(100))]);
        let err = coordinator(t.clone(), 1)
            .propose_with_retry("db", op(), || Ok((masters(&["a"]), Quorum::All)))
            .await
            .unwrap_err();
        assert!(matches!(err, BfrError::Conflict { .. }));
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_skips_unavailable_replicas() {
        let not_online = BfrError::DatabaseNotOnline {
            database: "db".into(),
            node: Some("a".into()),
        };
        let t = Scripted::new(&[
            ("a", Behavior::Reject(not_online)),
            ("b", Behavior::Holds(Some(4))),
        ]);
        let rid = RecordId::new("person", "1");
        let r = coordinator(t, 0)
            .read("db", &rid, nodes(&["a", "b"]), Quorum::Count(1))
            .await
            .unwrap();
        assert_eq!(r.unwrap().value, b"b");
    }

    #[tokio::test]
    async fn quorum_read_returns_highest_version() {
        let t = Scripted::new(&[
            ("a", Behavior::Holds(Some(2))),
            ("b", Behavior::Holds(Some(5))),
            ("c", Behavior::Holds(None)),
        ]);
        let rid = RecordId::new("person", "1");
        let r = coordinator(t, 0)
            .read("db", &rid, nodes(&["a", "b", "c"]), Quorum::All)
            .await
            .unwrap();
        assert_eq!(r.unwrap().version, 5);
    }
}
