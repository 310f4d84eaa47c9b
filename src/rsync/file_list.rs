use std::borrow::Cow;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;

use eyre::{bail, ensure, Result, WrapErr};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::rsync::envelope::RsyncReadExt;

#[allow(dead_code)]
const XMIT_TOP_DIR: u8 = 1 << 0; /* Informational only */
const XMIT_SAME_MODE: u8 = 1 << 1;
const XMIT_EXTENDED_FLAGS: u8 = 1 << 2;
#[allow(dead_code)]
const XMIT_SAME_RDEV_PRE28: u8 = XMIT_EXTENDED_FLAGS; /* Only in protocols < 28 */
#[allow(dead_code)]
const XMIT_SAME_UID: u8 = 1 << 3;
#[allow(dead_code)]
const XMIT_SAME_GID: u8 = 1 << 4;
const XMIT_SAME_NAME: u8 = 1 << 5;
const XMIT_LONG_NAME: u8 = 1 << 6;
const XMIT_SAME_TIME: u8 = 1 << 7;

const PATH_MAX: u32 = 4096;

/// Symlink test as the protocol-27 sender encodes it; not the canonical
/// S_IFLNK comparison. The sender writes a target for exactly this bit
/// pattern, so changing it desynchronizes the decoder.
fn wire_symlink(mode: u32) -> bool {
    mode & 0x8000 != 0 && mode & 0x2000 != 0
}

/// One remote filesystem object. Paths are raw bytes, not guaranteed UTF-8.
#[derive(Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<u8>,
    pub size: i64,
    pub mtime: i32,
    pub mode: u32,
    pub link_target: Option<Vec<u8>>,
}

impl FileEntry {
    pub fn path_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.path)
    }

    pub fn is_regular(&self) -> bool {
        unix_mode::is_file(self.mode)
    }

    pub fn is_symlink(&self) -> bool {
        wire_symlink(self.mode)
    }
}

impl Debug for FileEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEntry")
            .field("path", &self.path_lossy())
            .field("size", &self.size)
            .field("mtime", &self.mtime)
            .field("mode", &unix_mode::to_string(self.mode))
            .field(
                "link_target",
                &self.link_target.as_ref().map(|t| String::from_utf8_lossy(t)),
            )
            .finish()
    }
}

/// The remote tree, sorted ascending by raw path bytes. Positions in this
/// sequence are the indices exchanged during the transfer phase.
#[derive(Debug, Clone, Default)]
pub struct FileList(pub Vec<FileEntry>);

impl Deref for FileList {
    type Target = [FileEntry];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FileList {
    /// Decodes the delta-encoded list up to its terminating zero flag byte,
    /// then sorts it. The trailing aggregated I/O error word is left on the
    /// wire for the caller.
    pub async fn read_from<R: AsyncRead + Unpin + Send>(rx: &mut R) -> Result<Self> {
        let mut entries: Vec<FileEntry> = Vec::new();
        loop {
            let flags = rx.read_u8().await?;
            if flags == 0 {
                break;
            }
            let entry = read_entry(rx, flags, entries.last())
                .await
                .wrap_err_with(|| format!("file list entry #{}", entries.len()))?;
            debug!(?entry, "recv file entry");
            entries.push(entry);
        }

        entries.sort_by(|x, y| x.path.cmp(&y.path));
        entries.dedup_by(|x, y| x.path == y.path);
        Ok(Self(entries))
    }
}

async fn read_entry<R: AsyncRead + Unpin + Send>(
    rx: &mut R,
    flags: u8,
    prev: Option<&FileEntry>,
) -> Result<FileEntry> {
    let same_name = flags & XMIT_SAME_NAME != 0;
    let long_name = flags & XMIT_LONG_NAME != 0;
    let same_time = flags & XMIT_SAME_TIME != 0;
    let same_mode = flags & XMIT_SAME_MODE != 0;

    let partial = if same_name {
        usize::from(rx.read_u8().await?)
    } else {
        0
    };
    let tail_len = if long_name {
        rx.read_u32_le().await?
    } else {
        u32::from(rx.read_u8().await?)
    };
    ensure!(partial as u32 + tail_len <= PATH_MAX, "path too long");

    let mut path = Vec::with_capacity(partial + tail_len as usize);
    if same_name {
        let Some(prev) = prev else {
            bail!("name delta without a previous entry");
        };
        ensure!(
            partial <= prev.path.len(),
            "name delta prefix {partial} exceeds previous path length {}",
            prev.path.len()
        );
        path.extend_from_slice(&prev.path[..partial]);
    }
    let start = path.len();
    path.resize(start + tail_len as usize, 0);
    rx.read_exact(&mut path[start..]).await?;

    let size = rx.read_rsync_long().await?;

    let mtime = if same_time {
        let Some(prev) = prev else {
            bail!("time delta without a previous entry");
        };
        prev.mtime
    } else {
        rx.read_i32_le().await?
    };

    let mode = if same_mode {
        let Some(prev) = prev else {
            bail!("mode delta without a previous entry");
        };
        prev.mode
    } else {
        rx.read_u32_le().await?
    };

    // Uid, gid, rdev are absent: the requested options do not preserve them.

    let link_target = if wire_symlink(mode) {
        let len = rx.read_u32_le().await?;
        ensure!(len <= PATH_MAX, "symlink target too long");
        let mut target = vec![0u8; len as usize];
        rx.read_exact(&mut target).await?;
        Some(target)
    } else {
        None
    };

    Ok(FileEntry {
        path,
        size,
        mtime,
        mode,
        link_target,
    })
}
