use std::fs::{self, File};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use crate::error::{OpsError, Result};

const API_TIMEOUT: Duration = Duration::from_secs(60);

/// Administrative HTTP surface of the local Dataverse instance, plus plain
/// artifact downloads.
pub trait AdminApi {
    /// Version reported by `/api/info/version`.
    fn version(&self) -> Result<String>;

    /// Load a metadata block TSV through `/api/admin/datasetfield/load`.
    fn load_metadata_block(&self, tsv: &Path) -> Result<String>;

    /// Start a full (asynchronous) reindex.
    fn reindex(&self) -> Result<String>;

    /// Field list consumed by Solr's `update-fields.sh`.
    fn solr_field_schema(&self) -> Result<String>;

    /// Stream `url` into `dest`, returning the byte count.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[allow(dead_code)]
    status: Option<String>,
    data: T,
}

#[derive(Debug, Deserialize)]
struct VersionData {
    version: String,
}

/// Extract the version from an `/api/info/version` response body.
pub fn parse_version_response(body: &str) -> Result<String> {
    let envelope: Envelope<VersionData> =
        serde_json::from_str(body.trim()).map_err(|err| OpsError::Http {
            url: "/api/info/version".to_string(),
            message: format!("unexpected response: {err}"),
        })?;
    Ok(envelope.data.version)
}

/// Strip a leading `v` so `v6.5` and `6.5` compare equal.
pub fn normalize_version(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed)
}

pub fn same_version(a: &str, b: &str) -> bool {
    normalize_version(a) == normalize_version(b)
}

/// Poll the version endpoint until it answers or `timeout` elapses.
pub fn wait_for_version(
    api: &dyn AdminApi,
    interval: Duration,
    timeout: Duration,
) -> Result<String> {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match api.version() {
            Ok(version) => {
                tracing::debug!("version endpoint answered after {attempts} attempt(s)");
                return Ok(version);
            }
            Err(err) => tracing::debug!("version endpoint not ready: {err}"),
        }
        if started.elapsed() >= timeout {
            return Err(OpsError::Timeout {
                what: "application server".to_string(),
                waited: timeout,
            });
        }
        thread::sleep(interval);
    }
}

pub struct HttpAdmin {
    base: String,
    client: Client,
}

impl HttpAdmin {
    pub fn new(base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| http_error(base, err))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn get_text(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        self.client
            .get(&url)
            .timeout(API_TIMEOUT)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.text())
            .map_err(|err| http_error(&url, err))
    }
}

impl AdminApi for HttpAdmin {
    fn version(&self) -> Result<String> {
        parse_version_response(&self.get_text("/api/info/version")?)
    }

    fn load_metadata_block(&self, tsv: &Path) -> Result<String> {
        let url = self.url("/api/admin/datasetfield/load");
        let body = fs::read(tsv)?;
        self.client
            .post(&url)
            .timeout(API_TIMEOUT)
            .header(CONTENT_TYPE, "text/tab-separated-values")
            .body(body)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.text())
            .map_err(|err| http_error(&url, err))
    }

    fn reindex(&self) -> Result<String> {
        self.get_text("/api/admin/index")
    }

    fn solr_field_schema(&self) -> Result<String> {
        self.get_text("/api/admin/index/solr/schema")
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| http_error(url, err))?;
        let mut file = File::create(dest)?;
        resp.copy_to(&mut file).map_err(|err| http_error(url, err))
    }
}

fn http_error(url: &str, err: reqwest::Error) -> OpsError {
    OpsError::Http {
        url: url.to_string(),
        message: err.to_string(),
    }
}
