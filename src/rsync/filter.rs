use eyre::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const EXCLUSION_LIST_END: i32 = 0;

/// One transfer filter, sent to the server as part of the exclusion list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Exclude(String),
    Include(String),
}

impl Rule {
    fn to_command(&self) -> String {
        match self {
            Rule::Exclude(pattern) => format!("-{pattern}"),
            Rule::Include(pattern) => format!("+{pattern}"),
        }
    }
}

/// Writes the exclusion list. With no rules this degenerates to the single
/// zero int that announces an empty list.
pub async fn send_rules<W: AsyncWrite + Unpin>(tx: &mut W, rules: &[Rule]) -> Result<()> {
    for rule in rules {
        let cmd = rule.to_command();
        tx.write_i32_le(cmd.len() as i32).await?;
        tx.write_all(cmd.as_bytes()).await?;
    }
    tx.write_i32_le(EXCLUSION_LIST_END).await?;
    Ok(())
}
