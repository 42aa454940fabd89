//! Administrative command surface of a bifrost node.

mod admin;
mod command;
mod convert;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use bfr_cluster::Transport;
use bfr_storage::RecordStore;

pub use admin::{AdminConsole, AdminReply};
pub use command::Command;
pub use convert::{bfr_to_reply, error_code, ErrorReply};

/// Execute one command per input line and write each reply to `output`.
/// Blank lines and lines starting with `--` are skipped. Returns how many
/// commands failed.
pub async fn run_console<S, T, R, W>(
    console: &mut AdminConsole<S, T>,
    input: R,
    mut output: W,
) -> anyhow::Result<usize>
where
    S: RecordStore,
    T: Transport,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut failed = 0;
    while let Some(line) = lines.next_line().await.context("failed to read command")? {
        let line = line.trim();
        if line.is_empty() || line.starts_with("--") {
            continue;
        }
        let reply = console.execute(line).await;
        if !reply.is_ok() {
            failed += 1;
        }
        output
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .context("failed to write reply")?;
    }
    output.flush().await.context("failed to flush replies")?;
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bfr_cluster::{ClusterSettings, LocalNetwork, Node, NodeInfo};
    use bfr_storage::MemRecordStore;

    #[tokio::test]
    async fn script_replies_line_by_line() {
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
        let mut console = AdminConsole::new(node);

        let script = b"-- setup\nCREATE DATABASE shop\n\nUSE shop\nUSE nowhere\n";
        let mut out = Vec::new();
        let failed = run_console(&mut console, &script[..], &mut out).await.unwrap();
        assert_eq!(failed, 1);

        let out = String::from_utf8(out).unwrap();
        let replies: Vec<&str> = out.lines().collect();
        assert_eq!(replies.len(), 3);
        assert!(replies[0].starts_with("OK database 'shop' created"));
        assert_eq!(replies[1], "OK using database 'shop'");
        assert!(replies[2].starts_with("ERROR DATABASE_NOT_FOUND"));
    }
}
