use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use indicatif::ProgressBar;
use md4::{Digest, Md4};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, KeyMap};
use crate::rsync::checksum::SumHead;
use crate::rsync::file_list::{FileEntry, FileList};
use crate::rsync::INDEX_END;

/// Bounded pipe between the wire and the backend sink.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Counters accumulated over one download phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub files: u64,
    pub bytes: u64,
    pub checksum_mismatches: u64,
    pub backend_failures: u64,
}

/// The receive half of the transfer phase: reads indices and data tokens off
/// the wire and streams each file's payload into the backend.
pub struct Downloader<R> {
    rx: R,
    seed: i32,
    backend: Arc<dyn Backend>,
    keys: KeyMap,
    progress: Option<ProgressBar>,
}

/// Aborts the backend put when dropped before [`PutGuard::finish`], so a
/// failed session never commits a partially-written object.
struct PutGuard {
    handle: Option<JoinHandle<Result<()>>>,
}

impl PutGuard {
    fn new(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    async fn finish(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| eyre!("backend task failed: {e}"))?,
            None => Ok(()),
        }
    }
}

impl Drop for PutGuard {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl<R: AsyncRead + Unpin + Send> Downloader<R> {
    pub fn new(
        rx: R,
        seed: i32,
        backend: Arc<dyn Backend>,
        keys: KeyMap,
        progress: Option<ProgressBar>,
    ) -> Self {
        Self {
            rx,
            seed,
            backend,
            keys,
            progress,
        }
    }

    /// Receives files until the server signals the end of the phase. The
    /// server echoes indices in the order the generator requested them; this
    /// loop takes whatever index comes next.
    pub async fn recv_task(&mut self, file_list: &FileList) -> Result<TransferStats> {
        let mut stats = TransferStats::default();
        loop {
            let idx = self.rx.read_i32_le().await?;
            if idx == INDEX_END {
                break;
            }

            let entry = usize::try_from(idx)
                .ok()
                .and_then(|i| file_list.get(i))
                .ok_or_else(|| eyre!("server sent out-of-range file index {idx}"))?;
            self.recv_file(idx, entry, &mut stats)
                .await
                .wrap_err_with(|| format!("while receiving #{idx} ({})", entry.path_lossy()))?;

            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
        }

        info!(?stats, "downloader finished");
        Ok(stats)
    }

    async fn recv_file(
        &mut self,
        idx: i32,
        entry: &FileEntry,
        stats: &mut TransferStats,
    ) -> Result<()> {
        let sum_head = SumHead::read_from(&mut self.rx).await?;
        debug!(idx, ?sum_head, size = entry.size, path = %entry.path_lossy(), "receiving file");

        let mut hasher = Md4::default();
        hasher.update(self.seed.to_le_bytes());

        let key = self.keys.key_for(&entry.path);
        let (mut sink, source) = tokio::io::duplex(PIPE_CAPACITY);
        let put = {
            let backend = Arc::clone(&self.backend);
            let key = key.clone();
            let size = entry.size;
            PutGuard::new(tokio::spawn(async move {
                backend.put(&key, Box::new(source), size).await
            }))
        };

        let mut sink_open = true;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let token = self.rx.read_i32_le().await?;
            if token == 0 {
                break;
            }
            if token < 0 {
                // Block-match tokens cannot arise: we always claim an empty
                // local file.
                return Err(eyre!("server sent block-match token {token}"));
            }

            let mut remaining = token as usize;
            stats.bytes += token as u64;
            while remaining > 0 {
                let n = remaining.min(buf.len());
                self.rx.read_exact(&mut buf[..n]).await?;
                hasher.update(&buf[..n]);
                if sink_open {
                    if let Err(e) = sink.write_all(&buf[..n]).await {
                        // Keep draining the wire so the session survives the
                        // loss of this one file.
                        warn!(key = %key, error = %e, "backend sink closed early");
                        sink_open = false;
                    }
                }
                remaining -= n;
            }
        }

        sink.shutdown().await.ok();
        drop(sink);

        let local = hasher.finalize();
        let mut remote = [0u8; 16];
        self.rx.read_exact(&mut remote).await?;

        match put.finish().await {
            Ok(()) if sink_open => stats.files += 1,
            Ok(()) => stats.backend_failures += 1,
            Err(e) => {
                stats.backend_failures += 1;
                error!(key = %key, error = ?e, "backend put failed");
            }
        }

        if local[..] != remote[..] {
            stats.checksum_mismatches += 1;
            warn!(
                key = %key,
                local = %hex::encode(local),
                remote = %hex::encode(remote),
                "md4 mismatch; keeping the file as received"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::store::ObjectStoreBackend;

    const SEED: i32 = 0x0BAD_C0DE;

    fn entry(path: &[u8], size: i64) -> FileEntry {
        FileEntry {
            path: path.to_vec(),
            size,
            mtime: 0,
            mode: 0o100644,
            link_target: None,
        }
    }

    fn data_frame(payload: &[u8]) -> Vec<u8> {
        let word = (7u32 << 24) | payload.len() as u32;
        let mut frame = word.to_le_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    fn error_frame(message: &[u8]) -> Vec<u8> {
        let word = (8u32 << 24) | message.len() as u32;
        let mut frame = word.to_le_bytes().to_vec();
        frame.extend_from_slice(message);
        frame
    }

    fn seeded_md4(payload: &[u8]) -> [u8; 16] {
        let mut hasher = Md4::default();
        hasher.update(SEED.to_le_bytes());
        hasher.update(payload);
        hasher.finalize().into()
    }

    fn served_file(idx: i32, payload: &[u8], digest: &[u8; 16]) -> Vec<u8> {
        let mut wire = idx.to_le_bytes().to_vec();
        wire.extend([0u8; 16]);
        wire.extend((payload.len() as i32).to_le_bytes());
        wire.extend_from_slice(payload);
        wire.extend(0i32.to_le_bytes());
        wire.extend_from_slice(digest);
        wire
    }

    fn downloader(
        wire: Vec<u8>,
        backend: Arc<dyn Backend>,
    ) -> Downloader<crate::rsync::envelope::EnvelopeRead<std::io::Cursor<Vec<u8>>>> {
        let rx = crate::rsync::envelope::EnvelopeRead::new(std::io::Cursor::new(wire));
        Downloader::new(rx, SEED, backend, KeyMap::new("mirror"), None)
    }

    #[tokio::test]
    async fn whole_file_lands_in_the_backend() {
        let payload = b"hello world";
        let mut body = served_file(0, payload, &seeded_md4(payload));
        body.extend(INDEX_END.to_le_bytes());
        let wire = data_frame(&body);

        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let list = FileList(vec![entry(b"hello.txt", payload.len() as i64)]);

        let stats = downloader(wire, backend.clone())
            .recv_task(&list)
            .await
            .unwrap();

        assert_eq!(stats.files, 1);
        assert_eq!(stats.bytes, payload.len() as u64);
        assert_eq!(stats.checksum_mismatches, 0);
        assert_eq!(backend.get("mirror/hello.txt").await.unwrap(), payload);
    }

    #[tokio::test]
    async fn error_frame_aborts_and_releases_the_partial_object() {
        let mut body = 0i32.to_le_bytes().to_vec();
        body.extend([0u8; 16]);
        body.extend(11i32.to_le_bytes());
        body.extend_from_slice(b"hello");
        let mut wire = data_frame(&body);
        wire.extend(error_frame(b"permission denied"));

        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let list = FileList(vec![entry(b"hello.txt", 11)]);

        let err = downloader(wire, backend.clone())
            .recv_task(&list)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("hello.txt"));
        assert!(err
            .chain()
            .any(|c| c.to_string().contains("permission denied")));
        assert!(backend.list("mirror").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn md4_mismatch_is_a_warning_not_an_abort() {
        let first = b"hello world";
        let second = b"second file";
        let mut body = served_file(0, first, &[0u8; 16]);
        body.extend(served_file(1, second, &seeded_md4(second)));
        body.extend(INDEX_END.to_le_bytes());
        let wire = data_frame(&body);

        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let list = FileList(vec![entry(b"a.txt", 11), entry(b"b.txt", 11)]);

        let stats = downloader(wire, backend.clone())
            .recv_task(&list)
            .await
            .unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.checksum_mismatches, 1);
        assert_eq!(backend.get("mirror/a.txt").await.unwrap(), first);
        assert_eq!(backend.get("mirror/b.txt").await.unwrap(), second);
    }

    #[tokio::test]
    async fn block_match_token_is_fatal() {
        let mut body = 0i32.to_le_bytes().to_vec();
        body.extend([0u8; 16]);
        body.extend((-5i32).to_le_bytes());
        let wire = data_frame(&body);

        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let list = FileList(vec![entry(b"a.txt", 1)]);

        let err = downloader(wire, backend)
            .recv_task(&list)
            .await
            .unwrap_err();
        assert!(err
            .chain()
            .any(|c| c.to_string().contains("block-match token")));
    }

    #[tokio::test]
    async fn out_of_range_index_is_fatal() {
        let wire = data_frame(&7i32.to_le_bytes());

        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let list = FileList(vec![entry(b"a.txt", 1)]);

        let err = downloader(wire, backend)
            .recv_task(&list)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out-of-range"));
    }
}
