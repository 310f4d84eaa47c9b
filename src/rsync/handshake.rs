//! Handshake phase.
//!
//! Everything up to the session seed is plaintext, LF-terminated ASCII: the
//! version exchange, module selection, MOTD, and the argument vector. Reading
//! the seed and sending the exclusion list switch the connection into
//! multiplexed mode.

use eyre::{bail, ensure, eyre, Result, WrapErr};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};
use url::Url;

use crate::rsync::envelope::EnvelopeRead;
use crate::rsync::filter::{self, Rule};

pub const CLIENT_VERSION: &str = "27.0";

const DEFAULT_PORT: u16 = 873;
const MAX_LINE: u64 = 1024;

/// A parsed `rsync://HOST[:PORT]/MODULE[/PATH]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub module: String,
    pub path: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).wrap_err_with(|| format!("invalid rsync endpoint {raw}"))?;
        ensure!(
            url.scheme() == "rsync",
            "endpoint must use the rsync:// scheme: {raw}"
        );
        let host = url
            .host_str()
            .ok_or_else(|| eyre!("endpoint has no host: {raw}"))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let raw_path = url.path();
        ensure!(raw_path.starts_with('/'), "endpoint has no module: {raw}");
        let mut segments = raw_path[1..].splitn(2, '/');
        let module = segments.next().unwrap_or_default().to_string();
        ensure!(!module.is_empty(), "endpoint has no module: {raw}");
        let path = match segments.next() {
            None | Some("") => "/".to_string(),
            Some(rest) => rest.to_string(),
        };

        Ok(Self {
            host,
            port,
            module,
            path,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Module-qualified path argument sent to the server.
    pub fn module_path(&self) -> String {
        format!("{}/{}", self.module, self.path)
    }
}

/// A connection still in the plaintext phase.
#[derive(Debug)]
pub struct HandshakeConn<'a> {
    pub tx: WriteHalf<'a>,
    pub rx: BufReader<ReadHalf<'a>>,
}

/// A connection past the protocol switch point: reads are demultiplexed,
/// writes go out raw.
#[derive(Debug)]
pub struct DemuxConn<'a> {
    pub tx: WriteHalf<'a>,
    pub rx: EnvelopeRead<BufReader<ReadHalf<'a>>>,
}

impl<'a> HandshakeConn<'a> {
    pub fn new(stream: &'a mut TcpStream) -> Self {
        let (rx, tx) = stream.split();
        Self {
            tx,
            rx: BufReader::with_capacity(256 * 1024, rx),
        }
    }

    /// Runs the plaintext exchange up to (not including) the session seed.
    /// Returns the server's advertised version string.
    #[instrument(skip(self))]
    pub async fn start_inband_exchange(&mut self, endpoint: &Endpoint) -> Result<String> {
        self.tx
            .write_all(format!("@RSYNCD: {CLIENT_VERSION}\n").as_bytes())
            .await?;

        let mut greeting = String::new();
        (&mut self.rx).take(MAX_LINE).read_line(&mut greeting).await?;
        ensure!(!greeting.is_empty(), "connection closed during greeting");
        let server_version = greeting
            .trim()
            .strip_prefix("@RSYNCD: ")
            .unwrap_or_else(|| greeting.trim())
            .to_string();
        info!(
            server_version,
            client_version = CLIENT_VERSION,
            "greeting exchanged"
        );

        self.tx
            .write_all(format!("{}\n", endpoint.module).as_bytes())
            .await?;

        loop {
            let mut line = String::new();
            let n = (&mut self.rx).take(MAX_LINE).read_line(&mut line).await?;
            ensure!(n != 0, "connection closed while selecting the module");

            if line.starts_with("@ERROR") {
                bail!("server error: {}", line.trim_end());
            } else if line.starts_with("@RSYNCD: AUTHREQD ") {
                bail!("server requires authentication");
            } else if line.starts_with("@RSYNCD: OK") {
                break;
            } else {
                // MOTD
                println!("{}", line.trim_end());
            }
        }

        // -l preserve_links -t preserve_times -r recursive -p perms
        let options = ["--server", "--sender", "-ltpr", "."];
        for opt in options {
            debug!(opt, "server option");
            self.tx.write_all(format!("{opt}\n").as_bytes()).await?;
        }
        let module_path = endpoint.module_path();
        debug!(module_path, "server option");
        self.tx
            .write_all(format!("{module_path}\n").as_bytes())
            .await?;
        self.tx.write_all(b"\n").await?;

        Ok(server_version)
    }

    /// Reads the session seed, switches the read side to demultiplexed mode,
    /// and sends the exclusion list.
    #[instrument(skip(self, rules))]
    pub async fn finalize(mut self, rules: &[Rule]) -> Result<(i32, DemuxConn<'a>)> {
        let seed = self.rx.read_i32_le().await?;
        debug!(seed);

        let mut conn = DemuxConn {
            tx: self.tx,
            rx: EnvelopeRead::new(self.rx),
        };
        filter::send_rules(&mut conn.tx, rules).await?;

        Ok((seed, conn))
    }
}

impl<'a> DemuxConn<'a> {
    /// Aggregated I/O error code the server accumulated while enumerating
    /// the module; follows the file list on the wire.
    pub async fn read_io_error(&mut self) -> Result<i32> {
        Ok(self.rx.read_i32_le().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_port_and_path() {
        let ep = Endpoint::parse("rsync://mirrors.example.org/ubuntu").unwrap();
        assert_eq!(ep.host, "mirrors.example.org");
        assert_eq!(ep.port, 873);
        assert_eq!(ep.module, "ubuntu");
        assert_eq!(ep.path, "/");
        assert_eq!(ep.module_path(), "ubuntu//");
    }

    #[test]
    fn endpoint_keeps_explicit_port_and_path() {
        let ep = Endpoint::parse("rsync://mirror:8873/debian/dists/stable").unwrap();
        assert_eq!(ep.port, 8873);
        assert_eq!(ep.module, "debian");
        assert_eq!(ep.path, "dists/stable");
        assert_eq!(ep.module_path(), "debian/dists/stable");
    }

    #[test]
    fn endpoint_without_module_is_rejected() {
        assert!(Endpoint::parse("rsync://mirrors.example.org").is_err());
        assert!(Endpoint::parse("rsync://mirrors.example.org/").is_err());
        assert!(Endpoint::parse("http://mirrors.example.org/ubuntu").is_err());
    }
}
