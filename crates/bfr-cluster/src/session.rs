use parking_lot::Mutex;

use bfr_storage::RecordStore;
use bfr_types::{
    BfrError, DatabaseName, NodeId, OpResponse, Operation, Record, RecordId, RecordVersion,
};

use crate::node::Node;
use crate::placement::RoutingMode;
use crate::transport::{Request, Response, Transport};

fn new_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl<S: RecordStore, T: Transport> Node<S, T> {
    /// Insert a new record of `class`. The cluster, and the node that
    /// coordinates the write, come from the database's placement strategy.
    pub async fn insert(
        &self,
        database: &str,
        class: &str,
        value: Vec<u8>,
    ) -> Result<RecordVersion, BfrError> {
        let ctx = &self.ctx;
        let config = ctx.config(database)?;
        let target = ctx
            .placement
            .choose_target(&config, class, ctx.local_id(), |n| ctx.serves(n, database))?;
        let op = Operation::insert(RecordId::new(target.cluster, new_key()), class, value);
        self.coordinate(&target.node, database, op)
            .await
            .map(|r| r.version().clone())
    }

    /// Replace the value of a record read at `expected_version`.
    pub async fn update(
        &self,
        database: &str,
        record: &RecordId,
        value: Vec<u8>,
        expected_version: u64,
    ) -> Result<RecordVersion, BfrError> {
        let op = Operation::update(record.clone(), value, expected_version);
        self.coordinate(self.id(), database, op).await.map(|r| r.version().clone())
    }

    pub async fn delete(
        &self,
        database: &str,
        record: &RecordId,
        expected_version: u64,
    ) -> Result<RecordVersion, BfrError> {
        let op = Operation::delete(record.clone(), expected_version);
        self.coordinate(self.id(), database, op).await.map(|r| r.version().clone())
    }

    /// Read a record through the read quorum. Deleted records read as `None`.
    pub async fn load(
        &self,
        database: &str,
        record: &RecordId,
    ) -> Result<Option<Record>, BfrError> {
        Ok(self.ctx.read(database, record).await?.filter(Record::is_live))
    }

    pub async fn count_class(&self, database: &str, class: &str) -> Result<u64, BfrError> {
        self.ctx.count_class(database, class).await
    }

    /// Open a session with the node-wide routing mode.
    pub fn open_session(&self, database: &str) -> Result<Session<S, T>, BfrError> {
        self.open_session_with(database, self.ctx.settings.routing)
    }

    pub fn open_session_with(
        &self,
        database: &str,
        routing: RoutingMode,
    ) -> Result<Session<S, T>, BfrError> {
        self.ctx.config(database)?;
        let session = Session {
            node: self.clone(),
            database: database.to_string(),
            routing,
            target: Mutex::new(None),
        };
        if routing == RoutingMode::PerConnection {
            session.coordinator()?;
        }
        Ok(session)
    }

    /// Run `op` with `coordinator` in charge. An unreachable coordinator is
    /// replaced by the local node; replicas acknowledge a re-sent operation
    /// without applying it twice.
    async fn coordinate(
        &self,
        coordinator: &str,
        database: &str,
        op: Operation,
    ) -> Result<OpResponse, BfrError> {
        if coordinator == self.id() {
            return self.ctx.write(database, op).await;
        }
        let request = Request::Coordinate {
            database: database.to_string(),
            op: op.clone(),
        };
        match self.ctx.send(coordinator, request).await {
            Ok(Response::Ack(ack)) => Ok(ack),
            Ok(other) => Err(BfrError::Storage(format!(
                "unexpected reply to coordinate: {other:?}"
            ))),
            Err(e @ (BfrError::NodeUnavailable(_) | BfrError::Timeout)) => {
                tracing::debug!(
                    coordinator,
                    database,
                    error = %e,
                    "coordinator unreachable, coordinating locally"
                );
                self.ctx.write(database, op).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Client session bound to one database.
///
/// With [`RoutingMode::PerConnection`] every operation is coordinated by the
/// node chosen when the session opened, until that node stops serving the
/// database.
pub struct Session<S, T> {
    node: Node<S, T>,
    database: DatabaseName,
    routing: RoutingMode,
    target: Mutex<Option<NodeId>>,
}

impl<S: RecordStore, T: Transport> Session<S, T> {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn routing(&self) -> RoutingMode {
        self.routing
    }

    /// Current coordinator of a per-connection session.
    pub fn target(&self) -> Option<NodeId> {
        self.target.lock().clone()
    }

    fn coordinator(&self) -> Result<NodeId, BfrError> {
        let ctx = &self.node.ctx;
        if self.routing == RoutingMode::PerRequest {
            return Ok(ctx.info.id.clone());
        }
        let mut target = self.target.lock();
        let current = target
            .as_ref()
            .filter(|n| ctx.serves(n.as_str(), &self.database));
        if let Some(node) = current {
            return Ok(node.clone());
        }
        let config = ctx.config(&self.database)?;
        let chosen = ctx
            .placement
            .choose_node(&config, ctx.local_id(), |n| ctx.serves(n, &self.database))?;
        if let Some(previous) = target.replace(chosen.clone()) {
            tracing::info!(
                database = %self.database,
                previous = %previous,
                target = %chosen,
                "session target reselected"
            );
        }
        Ok(chosen)
    }

    pub async fn insert(&self, class: &str, value: Vec<u8>) -> Result<RecordVersion, BfrError> {
        if self.routing == RoutingMode::PerRequest {
            return self.node.insert(&self.database, class, value).await;
        }
        let coordinator = self.coordinator()?;
        let ctx = &self.node.ctx;
        let config = ctx.config(&self.database)?;
        let target = ctx
            .placement
            .choose_target(&config, class, &coordinator, |n| ctx.serves(n, &self.database))?;
        let op = Operation::insert(RecordId::new(target.cluster, new_key()), class, value);
        self.node
            .coordinate(&coordinator, &self.database, op)
            .await
            .map(|r| r.version().clone())
    }

    pub async fn update(
        &self,
        record: &RecordId,
        value: Vec<u8>,
        expected_version: u64,
    ) -> Result<RecordVersion, BfrError> {
        let coordinator = self.coordinator()?;
        let op = Operation::update(record.clone(), value, expected_version);
        self.node
            .coordinate(&coordinator, &self.database, op)
            .await
            .map(|r| r.version().clone())
    }

    pub async fn delete(
        &self,
        record: &RecordId,
        expected_version: u64,
    ) -> Result<RecordVersion, BfrError> {
        let coordinator = self.coordinator()?;
        let op = Operation::delete(record.clone(), expected_version);
        self.node
            .coordinate(&coordinator, &self.database, op)
            .await
            .map(|r| r.version().clone())
    }

    pub async fn load(&self, record: &RecordId) -> Result<Option<Record>, BfrError> {
        self.node.load(&self.database, record).await
    }

    pub async fn count_class(&self, class: &str) -> Result<u64, BfrError> {
        self.node.count_class(&self.database, class).await
    }
}
