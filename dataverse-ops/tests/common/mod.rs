#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use dataverse_ops as dv;
use dv::admin::AdminApi;
use dv::env::Environment;
use dv::error::{OpsError, Result};
use dv::executor::{CommandOutput, CopySpec, Executor, LocalCommand, Location, RemoteHost};
use sha2::{Digest, Sha256};

pub const PRODUCTION_DOMAIN: &str = "dataverse.example.edu";
pub const STAGING_DOMAIN: &str = "staging.example.edu";

/// One side effect requested from the executor, rendered as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Remote(String),
    Local(String),
    Copy(String),
}

impl Call {
    pub fn text(&self) -> &str {
        match self {
            Call::Remote(text) | Call::Local(text) | Call::Copy(text) => text,
        }
    }
}

/// Records every call and answers from canned rules instead of running
/// anything.
#[derive(Default)]
pub struct FakeExecutor {
    calls: RefCell<Vec<Call>>,
    failures: Vec<(String, String)>,
    responses: Vec<(String, String)>,
    copy_fixtures: Vec<(String, String, String)>,
    moves: bool,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls whose text contains `pattern` fail with `output`.
    pub fn fail_on(mut self, pattern: &str, output: &str) -> Self {
        self.failures.push((pattern.to_string(), output.to_string()));
        self
    }

    /// Calls whose text contains `pattern` succeed with `output`.
    pub fn respond(mut self, pattern: &str, output: &str) -> Self {
        self.responses.push((pattern.to_string(), output.to_string()));
        self
    }

    /// A copy into a local destination containing `pattern` writes `file`
    /// (relative to the destination; empty for the destination itself).
    pub fn on_copy_write(mut self, pattern: &str, file: &str, contents: &str) -> Self {
        self.copy_fixtures
            .push((pattern.to_string(), file.to_string(), contents.to_string()));
        self
    }

    /// Successful `mv` calls rename on disk.
    pub fn performing_moves(mut self) -> Self {
        self.moves = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.text().to_string()).collect()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.position(pattern).is_some()
    }

    /// Index of the first call containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls.borrow().iter().position(|c| c.text().contains(pattern))
    }

    fn handle(&self, call: Call) -> Result<CommandOutput> {
        let text = call.text().to_string();
        self.calls.borrow_mut().push(call);
        if let Some((_, output)) = self.failures.iter().find(|(p, _)| text.contains(p.as_str())) {
            return Err(OpsError::Execution {
                command: text,
                status: Some(1),
                output: output.clone(),
            });
        }
        let output = self
            .responses
            .iter()
            .find(|(p, _)| text.contains(p.as_str()))
            .map(|(_, o)| o.clone())
            .unwrap_or_default();
        Ok(CommandOutput { status: 0, output })
    }
}

impl Executor for FakeExecutor {
    fn run_remote(&self, host: &RemoteHost, command: &str) -> Result<CommandOutput> {
        self.handle(Call::Remote(format!("{} {command}", host.destination())))
    }

    fn run_local(&self, command: &LocalCommand) -> Result<CommandOutput> {
        let output = self.handle(Call::Local(command.to_string()))?;
        if self.moves && command.program == "mv" {
            if let [from, to] = command.args.as_slice() {
                fs::rename(from, to).map_err(|err| OpsError::Execution {
                    command: command.to_string(),
                    status: Some(1),
                    output: err.to_string(),
                })?;
            }
        }
        Ok(output)
    }

    fn copy(&self, spec: &CopySpec) -> Result<CommandOutput> {
        if let Location::Local(dest) = &spec.dest {
            let rendered = dest.display().to_string();
            for (pattern, file, contents) in &self.copy_fixtures {
                if rendered.contains(pattern.as_str()) {
                    let path = if file.is_empty() { dest.clone() } else { dest.join(file) };
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    fs::write(&path, contents).unwrap();
                }
            }
        }
        self.handle(Call::Copy(spec.to_string()))
    }
}

/// Admin API double: versions are served from a queue whose last entry
/// repeats; downloads come from an in-memory table.
pub struct FakeAdmin {
    versions: RefCell<VecDeque<String>>,
    downloads: HashMap<String, Vec<u8>>,
    calls: RefCell<Vec<String>>,
}

impl FakeAdmin {
    pub fn new<'a>(versions: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            versions: RefCell::new(versions.into_iter().map(str::to_string).collect()),
            downloads: HashMap::new(),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn serve(mut self, url: &str, body: &[u8]) -> Self {
        self.downloads.insert(url.to_string(), body.to_vec());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl AdminApi for FakeAdmin {
    fn version(&self) -> Result<String> {
        self.calls.borrow_mut().push("version".to_string());
        let mut versions = self.versions.borrow_mut();
        let next = if versions.len() > 1 {
            versions.pop_front()
        } else {
            versions.front().cloned()
        };
        next.ok_or_else(|| OpsError::Http {
            url: "/api/info/version".to_string(),
            message: "connection refused".to_string(),
        })
    }

    fn load_metadata_block(&self, tsv: &Path) -> Result<String> {
        let name = tsv.file_name().unwrap().to_string_lossy();
        self.calls.borrow_mut().push(format!("load {name}"));
        Ok(r#"{"status":"OK"}"#.to_string())
    }

    fn reindex(&self) -> Result<String> {
        self.calls.borrow_mut().push("reindex".to_string());
        Ok("Reindex started".to_string())
    }

    fn solr_field_schema(&self) -> Result<String> {
        self.calls.borrow_mut().push("solr-schema".to_string());
        Ok("<field name=\"custom\" type=\"text_en\"/>\n".to_string())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        self.calls.borrow_mut().push(format!("download {url}"));
        let body = self.downloads.get(url).ok_or_else(|| OpsError::Http {
            url: url.to_string(),
            message: "404 Not Found".to_string(),
        })?;
        fs::write(dest, body)?;
        Ok(body.len() as u64)
    }
}

/// Mutable key set turned into an [`Environment`] at the end.
#[derive(Debug, Clone, Default)]
pub struct EnvBuilder(BTreeMap<String, String>);

impl EnvBuilder {
    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn unset(mut self, key: &str) -> Self {
        self.0.remove(key);
        self
    }

    pub fn build(self) -> Environment {
        Environment::from_pairs(self.0)
    }
}

/// Complete sync configuration with local paths under `root`.
pub fn sync_env(root: &Path) -> EnvBuilder {
    let local = |name: &str| root.join(name).display().to_string();
    EnvBuilder::default()
        .set("DOMAIN", STAGING_DOMAIN)
        .set("DATAVERSE_USER", "dataverse")
        .set("PAYARA", local("payara6"))
        .set("DATAVERSE_CONTENT_STORAGE", local("files"))
        .set("SOLR_PATH", local("solr"))
        .set("SOLR_USER", "solr")
        .set("PRODUCTION_DOMAIN", PRODUCTION_DOMAIN)
        .set("PRODUCTION_SERVER", "dv-prod.example.edu")
        .set("PRODUCTION_SSH_USER", "root")
        .set("PRODUCTION_DATAVERSE_CONTENT_STORAGE", "/usr/local/dvn/data")
        .set("PRODUCTION_SOLR_PATH", "/usr/local/solr")
        .set("PRODUCTION_PAYARA", "/usr/local/payara6")
        .set("DB_HOST", "localhost")
        .set("DB_PORT", "5432")
        .set("DB_NAME", "dvndb")
        .set("DB_USER", "dvnapp")
        .set("DB_PASSWORD", "staging-secret")
        .set("PRODUCTION_DB_HOST", "db-prod.example.edu")
        .set("PRODUCTION_DB_NAME", "dvndb")
        .set("PRODUCTION_DB_USER", "dvnapp")
        .set("COUNTER_PROCESSOR_DIR", local("counter-processor"))
        .set("PRODUCTION_COUNTER_PROCESSOR_DIR", "/usr/local/counter-processor")
}

/// Minimal `domain.xml` declaring `fqdn` for the install under `payara`.
pub fn write_domain_xml(payara: &Path, fqdn: &str) -> PathBuf {
    let path = dv::domain_xml::config_path(payara);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        format!(
            r#"<domain>
  <configs>
    <config name="server-config">
      <java-config classpath-suffix="">
        <jvm-options>-Ddataverse.fqdn={fqdn}</jvm-options>
        <jvm-options>-Xmx2g</jvm-options>
      </java-config>
    </config>
  </configs>
</domain>
"#
        ),
    )
    .unwrap();
    path
}

/// Body of `/api/info/version` as the production host returns it.
pub fn version_body(version: &str) -> String {
    format!(r#"{{"status":"OK","data":{{"version":"{version}","build":"1234"}}}}"#)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
