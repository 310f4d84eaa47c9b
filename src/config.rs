use std::path::Path;

use eyre::{Result, WrapErr};
use serde::Deserialize;

/// Runtime configuration, loadable from a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_endpoint: String,
    pub s3_bucket: String,
    pub s3_prefix: String,

    pub rsync_endpoint: String,

    pub log_level: String,
    pub exclude: Vec<String>,
    pub continue_on_remote_errors: bool,
    pub diagnostics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            s3_access_key: String::new(),
            s3_secret_key: String::new(),
            s3_endpoint: "http://localhost:9000".into(),
            s3_bucket: "test-bucket".into(),
            s3_prefix: "ubuntu".into(),
            rsync_endpoint: "rsync://rsync.mirrors.ustc.edu.cn/ubuntu".into(),
            log_level: "info".into(),
            exclude: Vec::new(),
            continue_on_remote_errors: false,
            diagnostics_port: None,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path)
            .wrap_err_with(|| format!("reading config {}", path.display()))?;
        serde_json::from_slice(&content)
            .wrap_err_with(|| format!("parsing config {}", path.display()))
    }
}
