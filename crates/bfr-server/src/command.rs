use std::str::FromStr;

use bfr_cluster::{DatabaseOptions, ServerRole, StrategyKind};
use bfr_types::{BfrError, Quorum};

/// One administrative command. Keywords are case-insensitive; names keep
/// their case.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateDatabase { name: String, options: DatabaseOptions },
    DropDatabase { name: String },
    Use { name: String },
    /// Full resync of the named database, or of the current one.
    SyncDatabase { name: Option<String> },
    SyncCluster { cluster: String },
    Status,
    CreateIndex {
        name: String,
        class: String,
        unique: bool,
    },
    /// Role of a server in the current database.
    SetRole { node: String, role: ServerRole },
}

fn invalid(msg: impl Into<String>) -> BfrError {
    BfrError::InvalidArgument(msg.into())
}

struct Tokens<'a> {
    words: Vec<&'a str>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        let line = line.trim().trim_end_matches(';');
        Tokens {
            words: line.split_whitespace().collect(),
            pos: 0,
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        let word = self.words.get(self.pos).copied();
        if word.is_some() {
            self.pos += 1;
        }
        word
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.words.get(self.pos).is_some_and(|w| w.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), BfrError> {
        match self.next() {
            Some(w) if w.eq_ignore_ascii_case(keyword) => Ok(()),
            Some(w) => Err(invalid(format!("expected {keyword}, found '{w}'"))),
            None => Err(invalid(format!("expected {keyword}"))),
        }
    }

    fn value(&mut self, what: &str) -> Result<&'a str, BfrError> {
        self.next().ok_or_else(|| invalid(format!("missing {what}")))
    }

    fn finish(&self) -> Result<(), BfrError> {
        match self.words.get(self.pos) {
            None => Ok(()),
            Some(extra) => Err(invalid(format!("unexpected '{extra}'"))),
        }
    }
}

impl FromStr for Command {
    type Err = BfrError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut t = Tokens::new(line);
        let first = t.value("command")?.to_ascii_uppercase();
        let command = match first.as_str() {
            "CREATE" => {
                let what = t.value("CREATE target")?.to_ascii_uppercase();
                match what.as_str() {
                    "DATABASE" => create_database(&mut t)?,
                    "INDEX" => create_index(&mut t)?,
                    other => return Err(invalid(format!("cannot create '{other}'"))),
                }
            }
            "DROP" => {
                t.keyword("DATABASE")?;
                Command::DropDatabase { name: t.value("database name")?.to_string() }
            }
            "USE" => Command::Use { name: t.value("database name")?.to_string() },
            "HA" => {
                let what = t.value("HA command")?.to_ascii_uppercase();
                match what.as_str() {
                    "STATUS" => Command::Status,
                    "SYNC" => {
                        let scope = t.value("SYNC target")?.to_ascii_uppercase();
                        match scope.as_str() {
                            "DATABASE" => Command::SyncDatabase {
                                name: t.next().map(str::to_string),
                            },
                            "CLUSTER" => Command::SyncCluster {
                                cluster: t.value("cluster name")?.to_string(),
                            },
                            other => return Err(invalid(format!("cannot sync '{other}'"))),
                        }
                    }
                    "SET" => {
                        t.keyword("ROLE")?;
                        let node = t.value("server name")?.to_string();
                        let role = t.value("MASTER or REPLICA")?;
                        let role = role
                            .to_ascii_lowercase()
                            .parse::<ServerRole>()
                            .map_err(|_| invalid(format!("unknown server role '{role}'")))?;
                        Command::SetRole { node, role }
                    }
                    other => return Err(invalid(format!("unknown HA command '{other}'"))),
                }
            }
            other => return Err(invalid(format!("unknown command '{other}'"))),
        };
        t.finish()?;
        Ok(command)
    }
}

fn create_database(t: &mut Tokens<'_>) -> Result<Command, BfrError> {
    let name = t.value("database name")?.to_string();
    let mut options = DatabaseOptions::default();
    while let Some(option) = t.next() {
        let option = option.to_ascii_uppercase();
        let value = t.value(&format!("{option} value"))?;
        match option.as_str() {
            "READQUORUM" => options.read_quorum = Some(quorum(value)?),
            "WRITEQUORUM" => options.write_quorum = Some(quorum(value)?),
            "STRATEGY" => {
                let strategy = value
                    .parse::<StrategyKind>()
                    .map_err(|_| invalid(format!("unknown placement strategy '{value}'")))?;
                options.strategy = Some(strategy);
            }
            other => return Err(invalid(format!("unknown database option '{other}'"))),
        }
    }
    Ok(Command::CreateDatabase { name, options })
}

fn quorum(value: &str) -> Result<Quorum, BfrError> {
    value.parse().map_err(|_| invalid(format!("invalid quorum '{value}'")))
}

/// `CREATE INDEX Class.field UNIQUE` or `CREATE INDEX name ON Class UNIQUE`.
fn create_index(t: &mut Tokens<'_>) -> Result<Command, BfrError> {
    let name = t.value("index name")?.to_string();
    let mut class = name.split_once('.').map(|(class, _)| class.to_string());
    if t.peek_keyword("ON") {
        t.keyword("ON")?;
        class = Some(t.value("class name")?.to_string());
    }
    let class = class.ok_or_else(|| invalid(format!("index '{name}' needs ON <class>")))?;
    let unique = match t.value("UNIQUE or NOTUNIQUE")?.to_ascii_uppercase().as_str() {
        "UNIQUE" => true,
        "NOTUNIQUE" => false,
        other => return Err(invalid(format!("unknown index type '{other}'"))),
    };
    Ok(Command::CreateIndex { name, class, unique })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        line.parse().unwrap()
    }

    #[test]
    fn create_database_with_options() {
        let cmd =
            parse("create database Shop READQUORUM 2 writequorum majority STRATEGY local;");
        assert_eq!(
            cmd,
            Command::CreateDatabase {
                name: "Shop".into(),
                options: DatabaseOptions {
                    read_quorum: Some(Quorum::Count(2)),
                    write_quorum: Some(Quorum::Majority),
                    strategy: Some(StrategyKind::Local),
                },
            }
        );
        assert_eq!(
            parse("CREATE DATABASE plain"),
            Command::CreateDatabase {
                name: "plain".into(),
                options: DatabaseOptions::default()
            }
        );
    }

    #[test]
    fn ha_commands() {
        assert_eq!(parse("HA STATUS"), Command::Status);
        assert_eq!(parse("ha sync database"), Command::SyncDatabase { name: None });
        assert_eq!(
            parse("HA SYNC DATABASE shop"),
            Command::SyncDatabase {
                name: Some("shop".into())
            }
        );
        assert_eq!(
            parse("HA SYNC CLUSTER person"),
            Command::SyncCluster {
                cluster: "person".into()
            }
        );
        assert_eq!(
            parse("ha set role node2 REPLICA"),
            Command::SetRole {
                node: "node2".into(),
                role: ServerRole::Replica
            }
        );
        assert_eq!(
            parse("HA SET ROLE node2 master;"),
            Command::SetRole {
                node: "node2".into(),
                role: ServerRole::Master
            }
        );
    }

    #[test]
    fn index_forms() {
        assert_eq!(
            parse("CREATE INDEX Person.email UNIQUE"),
            Command::CreateIndex {
                name: "Person.email".into(),
                class: "Person".into(),
                unique: true
            }
        );
        assert_eq!(
            parse("create index byName on Person notunique"),
            Command::CreateIndex {
                name: "byName".into(),
                class: "Person".into(),
                unique: false
            }
        );
    }

    #[test]
    fn malformed_commands_are_rejected() {
        for line in [
            "",
            "SELECT FROM Person",
            "DROP TABLE x",
            "USE",
            "USE a b",
            "CREATE DATABASE x WRITEQUORUM",
            "CREATE DATABASE x WRITEQUORUM most",
            "CREATE DATABASE x STRATEGY random",
            "CREATE INDEX byName UNIQUE",
            "CREATE INDEX Person.email SOMETIMES",
            "HA SYNC EVERYTHING",
            "HA SET ROLE node2",
            "HA SET ROLE node2 OBSERVER",
            "HA SET ROLE node2 REPLICA now",
        ] {
            let err = line.parse::<Command>().unwrap_err();
            assert!(matches!(err, BfrError::InvalidArgument(_)), "{line}: {err:?}");
        }
    }
}
