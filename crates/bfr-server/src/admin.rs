use std::fmt;

use bfr_cluster::{ClusterStatus, IndexDef, Node, ServerRole, Transport};
use bfr_storage::RecordStore;
use bfr_types::BfrError;

use crate::command::Command;
use crate::convert::{bfr_to_reply, ErrorReply};

#[derive(Debug, Clone)]
pub enum AdminReply {
    Done(String),
    Status(ClusterStatus),
    Failed(ErrorReply),
}

impl AdminReply {
    pub fn is_ok(&self) -> bool {
        !matches!(self, AdminReply::Failed(_))
    }
}

impl fmt::Display for AdminReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminReply::Done(msg) => write!(f, "OK {msg}"),
            AdminReply::Failed(err) => write!(f, "{err}"),
            AdminReply::Status(status) => {
                writeln!(f, "node {}", status.local)?;
                writeln!(f, "members:")?;
                for m in &status.members {
                    writeln!(f, "  {:<12} {:<8} {}", m.id, m.state, m.address)?;
                }
                write!(f, "databases:")?;
                for db in &status.databases {
                    write!(
                        f,
                        "\n  {} v{} read={} write={} strategy={} servers=[{}]",
                        db.database,
                        db.version,
                        db.read_quorum,
                        db.write_quorum,
                        db.strategy,
                        db.all_servers().join(",")
                    )?;
                    let replicas: Vec<&str> = db
                        .roles
                        .iter()
                        .filter(|(_, role)| **role == ServerRole::Replica)
                        .map(|(node, _)| node.as_str())
                        .collect();
                    if !replicas.is_empty() {
                        write!(f, " replicas=[{}]", replicas.join(","))?;
                    }
                    for entry in status.statuses.iter().filter(|e| e.database == db.database) {
                        write!(f, "\n    {:<12} {}", entry.node, entry.status)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Runs administrative commands against one node. Remembers the database
/// selected with `USE`.
pub struct AdminConsole<S, T> {
    node: Node<S, T>,
    current: Option<String>,
}

impl<S: RecordStore, T: Transport> AdminConsole<S, T> {
    pub fn new(node: Node<S, T>) -> Self {
        AdminConsole { node, current: None }
    }

    pub fn current_database(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Parse and run one command line.
    pub async fn execute(&mut self, line: &str) -> AdminReply {
        let result = match line.parse::<Command>() {
            Ok(command) => self.run(command).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            tracing::debug!(
                node = %self.node.id(),
                command = line,
                error = %e,
                "admin command failed"
            );
            AdminReply::Failed(bfr_to_reply(e))
        })
    }

    pub async fn run(&mut self, command: Command) -> Result<AdminReply, BfrError> {
        tracing::info!(node = %self.node.id(), ?command, "admin command");
        match command {
            Command::CreateDatabase { name, options } => {
                let config = self.node.create_database(&name, options).await?;
                Ok(AdminReply::Done(format!(
                    "database '{name}' created (version {}, {} servers)",
                    config.version,
                    config.all_servers().len()
                )))
            }
            Command::DropDatabase { name } => {
                self.node.drop_database(&name).await?;
                if self.current.as_deref() == Some(name.as_str()) {
                    self.current = None;
                }
                Ok(AdminReply::Done(format!("database '{name}' dropped")))
            }
            Command::Use { name } => {
                if self.node.get_online_database_configuration(&name).is_none() {
                    return Err(BfrError::DatabaseNotFound(name));
                }
                let msg = format!("using database '{name}'");
                self.current = Some(name);
                Ok(AdminReply::Done(msg))
            }
            Command::SyncDatabase { name } => {
                let database = match name {
                    Some(name) => name,
                    None => self.selected()?.to_string(),
                };
                let stats = self.node.sync_database(&database).await?;
                Ok(AdminReply::Done(format!(
                    "database '{database}' synchronized ({} applied, {} skipped)",
                    stats.applied, stats.skipped
                )))
            }
            Command::SyncCluster { cluster } => {
                let database = self.selected()?.to_string();
                let stats = self.node.sync_cluster(&database, &cluster).await?;
                Ok(AdminReply::Done(format!(
                    "cluster '{cluster}' of '{database}' synchronized ({} applied, {} skipped)",
                    stats.applied, stats.skipped
                )))
            }
            Command::Status => Ok(AdminReply::Status(self.node.cluster_status())),
            Command::CreateIndex { name, class, unique } => {
                let database = self.selected()?.to_string();
                let index = IndexDef {
                    name: name.clone(),
                    class,
                    unique,
                };
                let config = self.node.create_index(&database, index).await?;
                Ok(AdminReply::Done(format!(
                    "index '{name}' created (configuration version {})",
                    config.version
                )))
            }
            Command::SetRole { node, role } => {
                let database = self.selected()?.to_string();
                let config = self.node.set_server_role(&database, &node, role).await?;
                Ok(AdminReply::Done(format!(
                    "server '{node}' is now {} of '{database}' (configuration version {})",
                    role.to_string().to_ascii_uppercase(),
                    config.version
                )))
            }
        }
    }

    fn selected(&self) -> Result<&str, BfrError> {
        self.current
            .as_deref()
            .ok_or_else(|| {
                BfrError::InvalidArgument("no database selected, run USE <name> first".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfr_cluster::{ClusterSettings, LocalNetwork, NodeInfo};
    use bfr_storage::MemRecordStore;
    use std::sync::Arc;

    async fn console() -> AdminConsole<MemRecordStore, LocalNetwork> {
        let net = LocalNetwork::new();
        let inbox = net.register("a");
        let node = Node::start(
            NodeInfo::new("a", "mem://a"),
            ClusterSettings::default(),
            Arc::new(MemRecordStore::new()),
            net,
            inbox,
            &[],
        )
        .await
        .unwrap();
        AdminConsole::new(node)
    }

    fn code(reply: &AdminReply) -> Option<&'static str> {
        match reply {
            AdminReply::Failed(e) => Some(e.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn database_lifecycle_through_commands() {
        let mut console = console().await;
        assert!(console.execute("CREATE DATABASE shop WRITEQUORUM 1").await.is_ok());
        let again = console.execute("create database shop").await;
        assert_eq!(code(&again), Some("DUPLICATE_DATABASE"));

        assert!(console.execute("USE shop").await.is_ok());
        assert_eq!(console.current_database(), Some("shop"));
        assert!(console.execute("CREATE INDEX Person.email UNIQUE").await.is_ok());
        let dup = console.execute("CREATE INDEX Person.email NOTUNIQUE").await;
        assert_eq!(code(&dup), Some("INVALID_ARGUMENT"));

        let status = console.execute("HA STATUS").await.to_string();
        assert!(status.contains("shop v2"), "{status}");
        assert!(status.contains("ONLINE"), "{status}");

        assert!(console.execute("HA SYNC DATABASE").await.is_ok());
        assert!(console.execute("DROP DATABASE shop").await.is_ok());
        assert_eq!(console.current_database(), None);
        assert_eq!(code(&console.execute("USE shop").await), Some("DATABASE_NOT_FOUND"));
    }

    #[tokio::test]
    async fn errors_carry_code_and_retry_hint() {
        let mut console = console().await;
        let reply = console.execute("HA SYNC CLUSTER person").await;
        assert_eq!(code(&reply), Some("INVALID_ARGUMENT"));

        console.execute("CREATE DATABASE shop").await;
        console.execute("USE shop").await;
        match console.execute("HA SYNC CLUSTER person").await {
            AdminReply::Failed(e) => {
                assert_eq!(e.code, "DATABASE_NOT_ONLINE");
                assert!(e.retryable);
            }
            other => panic!("unexpected reply: {other}"),
        }
        assert_eq!(code(&console.execute("HA RESTART").await), Some("INVALID_ARGUMENT"));
    }

    #[tokio::test]
    async fn server_roles_through_commands() {
        let mut console = console().await;
        let unselected = console.execute("HA SET ROLE a REPLICA").await;
        assert_eq!(code(&unselected), Some("INVALID_ARGUMENT"));

        console.execute("CREATE DATABASE shop").await;
        console.execute("USE shop").await;
        let stranger = console.execute("HA SET ROLE z REPLICA").await;
        assert_eq!(code(&stranger), Some("INVALID_ARGUMENT"));

        let reply = console.execute("HA SET ROLE a REPLICA").await.to_string();
        assert!(reply.contains("REPLICA"), "{reply}");
        let status = console.execute("HA STATUS").await.to_string();
        assert!(status.contains("replicas=[a]"), "{status}");

        assert!(console.execute("HA SET ROLE a MASTER").await.is_ok());
        let status = console.execute("HA STATUS").await.to_string();
        assert!(!status.contains("replicas="), "{status}");
    }
}
