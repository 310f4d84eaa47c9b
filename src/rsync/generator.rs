use std::ops::{Deref, DerefMut};

use eyre::{eyre, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument};

use crate::rsync::checksum::SumHead;
use crate::rsync::file_list::FileList;
use crate::rsync::INDEX_END;

/// The request half of the transfer phase: tells the server which file
/// indices to send. It never reads from the connection.
pub struct Generator<W>(pub W);

impl<W> Deref for Generator<W> {
    type Target = W;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<W> DerefMut for Generator<W> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<W: AsyncWrite + Unpin + Send> Generator<W> {
    /// Requests every regular file in `wanted`, in ascending index order,
    /// each with an empty sum header so the server sends the whole payload.
    #[instrument(skip_all)]
    pub async fn generate_task(&mut self, file_list: &FileList, wanted: &[usize]) -> Result<()> {
        let mut requested = 0u64;
        for &idx in wanted {
            let entry = &file_list[idx];
            if !entry.is_regular() {
                debug!(path = %entry.path_lossy(), "skip non-regular file");
                continue;
            }

            let wire_idx =
                i32::try_from(idx).map_err(|_| eyre!("file index {idx} overflows i32"))?;
            debug!(path = %entry.path_lossy(), idx, "request full file");
            self.write_i32_le(wire_idx).await?;
            SumHead::default().write_to(&mut self.0).await?;
            requested += 1;
        }

        self.write_i32_le(INDEX_END).await?;
        self.flush().await?;

        info!(requested, "generator finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsync::file_list::FileEntry;

    fn entry(path: &[u8], size: i64, mode: u32) -> FileEntry {
        FileEntry {
            path: path.to_vec(),
            size,
            mtime: 0,
            mode,
            link_target: None,
        }
    }

    #[tokio::test]
    async fn requests_only_regular_files_and_terminates() {
        let list = FileList(vec![
            entry(b"a", 3, 0o100644),
            entry(b"b", 0, 0o040755),
            entry(b"c", 5, 0o100600),
        ]);

        let mut generator = Generator(Vec::new());
        generator.generate_task(&list, &[0, 1, 2]).await.unwrap();

        let mut expected = Vec::new();
        expected.extend(0i32.to_le_bytes());
        expected.extend([0u8; 16]);
        expected.extend(2i32.to_le_bytes());
        expected.extend([0u8; 16]);
        expected.extend((-1i32).to_le_bytes());
        assert_eq!(generator.0, expected);
    }

    #[tokio::test]
    async fn empty_request_set_still_sends_the_terminator() {
        let list = FileList(vec![entry(b"a", 3, 0o100644)]);
        let mut generator = Generator(Vec::new());
        generator.generate_task(&list, &[]).await.unwrap();
        assert_eq!(generator.0, (-1i32).to_le_bytes());
    }
}
