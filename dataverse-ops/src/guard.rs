//! Pre-flight checks that keep the sync workflow away from production.
//!
//! The sync workflow overwrites the local database, content store and search
//! configuration. Running it on the production host, or pointing it at the
//! production database, would destroy the instance it is copying from. The
//! guard gathers what it needs once into a [`GuardContext`], runs the fatal
//! checks, and only then asks about the softer version-marker mismatch.
//!
//! [`preflight`] must return before any workflow step starts.

use std::fmt;
use std::path::Path;

use crate::admin::{parse_version_response, same_version, AdminApi};
use crate::confirm::Confirm;
use crate::domain_xml;
use crate::env::Environment;
use crate::error::{OpsError, Result};
use crate::executor::{Executor, RemoteHost};

/// Command run on the production host to read its version marker.
const REMOTE_VERSION_COMMAND: &str = "curl -fsS http://localhost:8080/api/info/version";

/// A fatal pre-flight failure. Display output names what was found and how
/// to fix it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyViolation {
    /// The local instance identifies itself as the production instance.
    IdentityIsProduction { identity: String, production: String },
    /// `DOMAIN` is configured to the production domain.
    DomainIsProduction { domain: String },
    /// The local database host is the production machine or database.
    DatabaseIsProduction {
        db_host: String,
        matched_key: &'static str,
    },
}

impl fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyViolation::IdentityIsProduction {
                identity,
                production,
            } => {
                writeln!(f, "Refusing to run: this host is the production instance.")?;
                writeln!(
                    f,
                    "  domain.xml identifies this server as '{identity}', which matches PRODUCTION_DOMAIN '{production}'."
                )?;
                write!(
                    f,
                    "Run the sync on the staging server, or correct PRODUCTION_DOMAIN in the env file."
                )
            }
            SafetyViolation::DomainIsProduction { domain } => {
                writeln!(f, "Refusing to run: DOMAIN and PRODUCTION_DOMAIN are both '{domain}'.")?;
                write!(
                    f,
                    "Set DOMAIN to the staging hostname so rewritten data points at staging."
                )
            }
            SafetyViolation::DatabaseIsProduction {
                db_host,
                matched_key,
            } => {
                writeln!(f, "Refusing to run: the restore target is the production database.")?;
                writeln!(f, "  DB_HOST '{db_host}' equals {matched_key}.")?;
                write!(f, "Point DB_HOST at the staging database server.")
            }
        }
    }
}

impl std::error::Error for SafetyViolation {}

/// Lower-cased hostname with trailing dots and whitespace removed.
fn normalize_host(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Everything the checks look at, gathered once.
#[derive(Debug, Clone)]
pub struct GuardContext {
    /// Hostname read from `domain.xml`, if any.
    pub identity: Option<String>,
    pub domain: String,
    pub production_domain: String,
    pub production_server: String,
    pub db_host: String,
    pub production_db_host: String,
}

impl GuardContext {
    pub fn new(env: &Environment) -> Result<Self> {
        let identity = match domain_xml::read_identity(Path::new(env.require("PAYARA")?)) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!("could not read domain.xml: {err}");
                None
            }
        };
        Ok(Self {
            identity,
            domain: env.require("DOMAIN")?.to_string(),
            production_domain: env.require("PRODUCTION_DOMAIN")?.to_string(),
            production_server: env.require("PRODUCTION_SERVER")?.to_string(),
            db_host: env.require("DB_HOST")?.to_string(),
            production_db_host: env.require("PRODUCTION_DB_HOST")?.to_string(),
        })
    }
}

pub fn check_domain(ctx: &GuardContext) -> std::result::Result<(), SafetyViolation> {
    if normalize_host(&ctx.domain) == normalize_host(&ctx.production_domain) {
        return Err(SafetyViolation::DomainIsProduction {
            domain: ctx.domain.clone(),
        });
    }
    Ok(())
}

pub fn check_identity(ctx: &GuardContext) -> std::result::Result<(), SafetyViolation> {
    if let Some(identity) = &ctx.identity {
        if normalize_host(identity) == normalize_host(&ctx.production_domain) {
            return Err(SafetyViolation::IdentityIsProduction {
                identity: identity.clone(),
                production: ctx.production_domain.clone(),
            });
        }
    }
    Ok(())
}

pub fn check_database(ctx: &GuardContext) -> std::result::Result<(), SafetyViolation> {
    let db_host = normalize_host(&ctx.db_host);
    for (key, value) in [
        ("PRODUCTION_SERVER", &ctx.production_server),
        ("PRODUCTION_DB_HOST", &ctx.production_db_host),
    ] {
        if db_host == normalize_host(value) {
            return Err(SafetyViolation::DatabaseIsProduction {
                db_host: ctx.db_host.clone(),
                matched_key: key,
            });
        }
    }
    Ok(())
}

/// Run every fatal check, then the interactive ones.
///
/// Read-only: safe to run in dry-run mode.
pub fn preflight(
    env: &Environment,
    executor: &dyn Executor,
    admin: &dyn AdminApi,
    confirm: &dyn Confirm,
) -> Result<()> {
    let ctx = GuardContext::new(env)?;

    check_domain(&ctx)?;
    check_database(&ctx)?;
    check_identity(&ctx)?;

    match &ctx.identity {
        Some(identity) => tracing::info!("local instance identifies as {identity}"),
        None => {
            tracing::warn!("could not determine this server's hostname from domain.xml");
            if !confirm.confirm(
                &format!(
                    "Is this server definitely NOT the production instance ({})?",
                    ctx.production_domain
                ),
                false,
            ) {
                return Err(OpsError::Declined(
                    "host identity could not be confirmed".to_string(),
                ));
            }
        }
    }

    check_versions(env, executor, admin, confirm)
}

fn production_version(env: &Environment, executor: &dyn Executor) -> Result<String> {
    let host = RemoteHost::new(
        env.require("PRODUCTION_SERVER")?,
        env.require("PRODUCTION_SSH_USER")?,
    );
    let out = executor.run_remote(&host, REMOTE_VERSION_COMMAND)?;
    parse_version_response(&out.output)
}

/// Compare the version markers of both instances; mismatches need an answer.
pub fn check_versions(
    env: &Environment,
    executor: &dyn Executor,
    admin: &dyn AdminApi,
    confirm: &dyn Confirm,
) -> Result<()> {
    let local = admin.version();
    let production = production_version(env, executor);

    let question = match (&local, &production) {
        (Ok(local), Ok(production)) if same_version(local, production) => {
            tracing::info!("both instances run version {local}");
            return Ok(());
        }
        (Ok(local), Ok(production)) => {
            tracing::warn!("version mismatch: production {production}, local {local}");
            format!("Production runs {production} but this instance runs {local}. Continue anyway?")
        }
        _ => {
            if let Err(err) = &local {
                tracing::warn!("local version unavailable: {err}");
            }
            if let Err(err) = &production {
                tracing::warn!("production version unavailable: {err}");
            }
            "Could not compare versions of the two instances. Continue anyway?".to_string()
        }
    };

    if confirm.confirm(&question, false) {
        Ok(())
    } else {
        Err(OpsError::Declined("version mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> GuardContext {
        GuardContext {
            identity: Some("staging.example.org".into()),
            domain: "staging.example.org".into(),
            production_domain: "dataverse.example.org".into(),
            production_server: "prod01.example.org".into(),
            db_host: "localhost".into(),
            production_db_host: "db.example.org".into(),
        }
    }

    #[test]
    fn staging_context_passes() {
        let ctx = ctx();
        assert!(check_domain(&ctx).is_ok());
        assert!(check_identity(&ctx).is_ok());
        assert!(check_database(&ctx).is_ok());
    }

    #[test]
    fn identity_comparison_ignores_case_and_trailing_dot() {
        let mut ctx = ctx();
        ctx.identity = Some("DataVerse.Example.org.".into());
        let err = check_identity(&ctx).unwrap_err();
        assert!(matches!(err, SafetyViolation::IdentityIsProduction { .. }));
        assert!(err.to_string().contains("production instance"));
    }

    #[test]
    fn unknown_identity_is_not_a_violation() {
        let mut ctx = ctx();
        ctx.identity = None;
        assert!(check_identity(&ctx).is_ok());
    }

    #[test]
    fn database_host_matches_either_production_name() {
        let mut ctx = ctx();
        ctx.db_host = "db.example.org".into();
        assert_eq!(
            check_database(&ctx),
            Err(SafetyViolation::DatabaseIsProduction {
                db_host: "db.example.org".into(),
                matched_key: "PRODUCTION_DB_HOST",
            })
        );

        ctx.db_host = "PROD01.example.org".into();
        let err = check_database(&ctx).unwrap_err();
        assert!(err.to_string().contains("PRODUCTION_SERVER"));
    }

    #[test]
    fn domain_equal_to_production_is_rejected() {
        let mut ctx = ctx();
        ctx.domain = "dataverse.example.org".into();
        assert!(check_domain(&ctx).is_err());
    }
}
