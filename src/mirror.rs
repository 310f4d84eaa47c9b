//! One mirror pass: handshake, list, diff against the backend, transfer,
//! symlink report.

use std::sync::Arc;

use clean_path::clean;
use eyre::{bail, Result, WrapErr};
use indicatif::ProgressBar;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::backend::{Backend, KeyMap};
use crate::config::Config;
use crate::diff::{diff, DiffItem};
use crate::rsync::downloader::{Downloader, TransferStats};
use crate::rsync::file_list::FileList;
use crate::rsync::filter::Rule;
use crate::rsync::generator::Generator;
use crate::rsync::handshake::{Endpoint, HandshakeConn};

/// A symbolic link present in the remote tree: the key it would occupy and
/// the bucket-absolute location it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkRecord {
    pub key: String,
    pub points_to: String,
}

pub async fn run(cfg: &Config, backend: Arc<dyn Backend>) -> Result<TransferStats> {
    let endpoint = Endpoint::parse(&cfg.rsync_endpoint)?;
    info!(
        host = %endpoint.host,
        module = %endpoint.module,
        path = %endpoint.path,
        "connecting"
    );

    let mut stream = TcpStream::connect(endpoint.addr())
        .await
        .wrap_err_with(|| format!("connecting to {}", endpoint.addr()))?;

    let mut conn = HandshakeConn::new(&mut stream);
    let server_version = conn.start_inband_exchange(&endpoint).await?;
    debug!(server_version, "handshake complete");

    let rules: Vec<Rule> = cfg.exclude.iter().cloned().map(Rule::Exclude).collect();
    let (seed, mut conn) = conn.finalize(&rules).await?;

    let file_list = FileList::read_from(&mut conn.rx).await?;
    info!(files = file_list.len(), "received file list");

    let io_error = conn.read_io_error().await?;
    if io_error != 0 {
        if cfg.continue_on_remote_errors {
            warn!(io_error, "server hit I/O errors while enumerating; continuing");
        } else {
            bail!("server hit I/O errors while enumerating the module (code {io_error})");
        }
    }

    let keys = KeyMap::new(cfg.s3_prefix.clone());
    let local = {
        let objects = backend.list(&cfg.s3_prefix).await?;
        let mut items: Vec<DiffItem> = objects
            .iter()
            .filter_map(|o| keys.relative(&o.key).map(|key| DiffItem::new(key, o.size)))
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    };
    let remote: Vec<DiffItem> = file_list
        .iter()
        .map(|e| DiffItem::new(e.path.clone(), e.size))
        .collect();

    let (new_items, stale_items) = diff(&local, &remote);
    info!(
        new = new_items.len(),
        stale = stale_items.len(),
        "diff against backend"
    );
    for &idx in &stale_items {
        debug!(
            key = %String::from_utf8_lossy(&local[idx].key),
            "stale object, left in place"
        );
    }

    let expected = new_items
        .iter()
        .filter(|&&i| file_list[i].is_regular())
        .count() as u64;
    let progress = ProgressBar::new(expected);

    let mut generator = Generator(conn.tx);
    let mut downloader = Downloader::new(
        conn.rx,
        seed,
        Arc::clone(&backend),
        keys.clone(),
        Some(progress.clone()),
    );

    let ((), stats) = tokio::try_join!(
        generator.generate_task(&file_list, &new_items),
        downloader.recv_task(&file_list),
    )?;
    progress.finish_and_clear();

    let links = symlink_records(cfg, &keys, &file_list, &new_items);
    for link in &links {
        info!(key = %link.key, points_to = %link.points_to, "symlink");
    }

    info!(
        files = stats.files,
        bytes = stats.bytes,
        checksum_mismatches = stats.checksum_mismatches,
        backend_failures = stats.backend_failures,
        symlinks = links.len(),
        "mirror pass complete"
    );

    let Generator(mut tx) = generator;
    tx.shutdown().await?;

    Ok(stats)
}

/// Collects the symlinks among the wanted entries. Links are recorded, not
/// materialized: the key namespace has no native symlink type.
pub fn symlink_records(
    cfg: &Config,
    keys: &KeyMap,
    file_list: &FileList,
    wanted: &[usize],
) -> Vec<SymlinkRecord> {
    wanted
        .iter()
        .filter_map(|&idx| {
            let entry = &file_list[idx];
            let target = entry.link_target.as_ref()?;
            let points_to = clean(format!(
                "{}/{}/{}",
                cfg.s3_bucket,
                cfg.s3_prefix,
                String::from_utf8_lossy(target)
            ))
            .to_string_lossy()
            .into_owned();
            Some(SymlinkRecord {
                key: keys.key_for(&entry.path),
                points_to,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsync::file_list::FileEntry;

    #[test]
    fn symlink_records_normalize_their_destination() {
        let cfg = Config {
            s3_bucket: "bucket".into(),
            s3_prefix: "mirror".into(),
            ..Config::default()
        };
        let keys = KeyMap::new("mirror");
        let list = FileList(vec![
            FileEntry {
                path: b"current".to_vec(),
                size: 9,
                mtime: 0,
                mode: 0o120777,
                link_target: Some(b"releases/./v2".to_vec()),
            },
            FileEntry {
                path: b"data.bin".to_vec(),
                size: 4,
                mtime: 0,
                mode: 0o100644,
                link_target: None,
            },
        ]);

        let records = symlink_records(&cfg, &keys, &list, &[0, 1]);
        assert_eq!(
            records,
            [SymlinkRecord {
                key: "mirror/current".into(),
                points_to: "bucket/mirror/releases/v2".into(),
            }]
        );
    }
}
