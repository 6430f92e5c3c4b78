//! Reading and patching the application server's `domain.xml`.
//!
//! Only the `<jvm-options>` elements of the `server-config` section are
//! inspected. Edits are textual so the rest of the document, including
//! comments and attribute order, is preserved byte for byte.

use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{OpsError, Result};

/// Options the current runtime needs on JDK 17.
pub const DEFAULT_JVM_OPTIONS: &[&str] = &[
    "[17|]--add-opens=java.management/javax.management=ALL-UNNAMED",
    "[17|]--add-opens=java.management/javax.management.openmbean=ALL-UNNAMED",
    "[17|]--add-opens=java.base/java.io=ALL-UNNAMED",
];

pub fn domain_dir(payara: &Path) -> PathBuf {
    payara.join("glassfish").join("domains").join("domain1")
}

pub fn config_path(payara: &Path) -> PathBuf {
    domain_dir(payara).join("config").join("domain.xml")
}

fn jvm_option_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<jvm-options>\s*(.*?)\s*</jvm-options>").expect("valid jvm-options regex")
    })
}

fn qualifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[[^\]]*\]").expect("valid qualifier regex"))
}

struct JvmOption {
    /// Byte range of the option text inside the document.
    span: Range<usize>,
    value: String,
}

/// The `<java-config>` block of `server-config`: the range of its body and
/// the options declared in it.
fn server_java_config(xml: &str) -> Option<(Range<usize>, Vec<JvmOption>)> {
    let config = xml.find(r#"<config name="server-config""#)?;
    let open = config + xml[config..].find("<java-config")?;
    let body_start = open + xml[open..].find('>')? + 1;
    let body_end = body_start + xml[body_start..].find("</java-config>")?;
    let options = jvm_option_re()
        .captures_iter(&xml[body_start..body_end])
        .filter_map(|caps| {
            let m = caps.get(1)?;
            Some(JvmOption {
                span: body_start + m.start()..body_start + m.end(),
                value: m.as_str().to_string(),
            })
        })
        .collect();
    Some((body_start..body_end, options))
}

fn unqualified(option: &str) -> &str {
    match qualifier_re().find(option) {
        Some(m) => &option[m.end()..],
        None => option,
    }
}

/// Identity of an option: `-Dname` for system properties, else the option.
fn option_key(option: &str) -> &str {
    let bare = unqualified(option);
    if bare.starts_with("-D") {
        bare.split('=').next().unwrap_or(bare)
    } else {
        bare
    }
}

fn system_property<'a>(options: &'a [JvmOption], name: &str) -> Option<&'a str> {
    let prefix = format!("-D{name}=");
    options
        .iter()
        .find_map(|opt| unqualified(&opt.value).strip_prefix(prefix.as_str()))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn host_of_url(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split('/').next()?;
    let authority = authority.rsplit('@').next()?;
    let host = authority.split(':').next()?;
    (!host.is_empty() && !host.contains("${")).then_some(host)
}

/// Public hostname the instance believes it serves.
///
/// Prefers `dataverse.fqdn`; falls back to the host of `dataverse.siteUrl`.
pub fn identity(xml: &str) -> Option<String> {
    let (_, options) = server_java_config(xml)?;
    if let Some(fqdn) = system_property(&options, "dataverse.fqdn") {
        if !fqdn.contains("${") {
            return Some(fqdn.to_string());
        }
    }
    system_property(&options, "dataverse.siteUrl")
        .and_then(host_of_url)
        .map(str::to_string)
}

/// Identity read from the installation under `payara`; `None` when the
/// file is absent or declares no hostname.
pub fn read_identity(payara: &Path) -> Result<Option<String>> {
    let path = config_path(payara);
    match fs::read_to_string(&path) {
        Ok(xml) => Ok(identity(&xml)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("{} not found", path.display());
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Make sure every option in `required` is declared exactly as given.
///
/// An option already present is left alone. One declared under the same key
/// with a different form (say, without the `[17|]` qualifier) is replaced in
/// place; anything else is appended to the `<java-config>` block. Applying
/// the result a second time changes nothing.
pub fn ensure_jvm_options(xml: &str, required: &[&str]) -> Result<(String, Vec<String>)> {
    let (body, options) = server_java_config(xml).ok_or_else(|| {
        OpsError::invalid_options("domain.xml has no <java-config> in server-config")
    })?;

    let indent = options
        .last()
        .map(|opt| {
            let line_start = xml[..opt.span.start].rfind('\n').map_or(0, |i| i + 1);
            xml[line_start..]
                .chars()
                .take_while(|c| c.is_whitespace())
                .collect::<String>()
        })
        .unwrap_or_else(|| "        ".to_string());

    let mut replacements: Vec<(Range<usize>, String)> = Vec::new();
    let mut appended = String::new();
    let mut changes = Vec::new();

    for want in required {
        if options.iter().any(|opt| opt.value == *want) {
            continue;
        }
        match options
            .iter()
            .find(|opt| option_key(&opt.value) == option_key(want))
        {
            Some(existing) => {
                replacements.push((existing.span.clone(), want.to_string()));
                changes.push(format!("replaced {} with {want}", existing.value));
            }
            None => {
                appended.push_str(&format!("{indent}<jvm-options>{want}</jvm-options>\n"));
                changes.push(format!("added {want}"));
            }
        }
    }

    if changes.is_empty() {
        return Ok((xml.to_string(), changes));
    }

    let mut out = xml.to_string();
    if !appended.is_empty() {
        // Insert at the start of the closing tag's line.
        let close_line = xml[..body.end].rfind('\n').map_or(body.end, |i| i + 1);
        let at = if xml[close_line..body.end].trim().is_empty() {
            close_line
        } else {
            appended.insert(0, '\n');
            body.end
        };
        out.insert_str(at, &appended);
    }
    replacements.sort_by_key(|(span, _)| span.start);
    for (span, text) in replacements.into_iter().rev() {
        out.replace_range(span, &text);
    }
    Ok((out, changes))
}

/// Patch the installed `domain.xml` in place; returns the applied changes.
pub fn ensure_jvm_options_file(payara: &Path, required: &[&str]) -> Result<Vec<String>> {
    let path = config_path(payara);
    let xml = fs::read_to_string(&path)?;
    let (patched, changes) = ensure_jvm_options(&xml, required)?;
    if !changes.is_empty() {
        fs::write(&path, patched)?;
    }
    Ok(changes)
}
