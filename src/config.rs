use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use russh::keys::ssh_key::{AuthorizedKeys, Fingerprint};
use russh::keys::{HashAlg, PublicKey};

use crate::oidc::OidcSettings;

/*
 * Bounds on the certificate validity period a settings document may request.
 */
const MIN_VALIDITY: Duration = Duration::from_secs(60);
const MAX_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/*
 * The extensions commonly supported for user certificates, per the OpenSSH
 * PROTOCOL.certkeys description.  Each one takes the empty string as its
 * value.
 */
pub const PERMITTED_EXTENSIONS: &[&str] = &[
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-X11-forwarding",
    "permit-user-rc",
];

/*
 * A SHA-256 fingerprint renders as "SHA256:" followed by 43 characters of
 * unpadded base64; 50 characters in all.
 */
const FINGERPRINT_PREFIX: &str = "SHA256:";
const FINGERPRINT_LENGTH: usize = 50;

/**
 * The settings document as it appears on disk.  Unknown fields are
 * rejected so that a typo cannot silently disable a record.
 */
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(deserialize_with = "parse_validity")]
    pub validity: Duration,
    #[serde(default)]
    pub organisation: String,
    #[serde(default)]
    pub banner: String,
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
    pub user_principals: Vec<UserEntry>,
    #[serde(default)]
    pub oidc: Option<OidcSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserEntry {
    pub name: String,
    #[serde(default)]
    pub authorized_key: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub oidc_subject: Option<String>,
    pub principals: Vec<String>,
}

fn parse_validity<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/**
 * A user recognised by this authority, immutable after load.  Identity
 * proof arrives as either an SSH key fingerprint or a verified OIDC
 * subject; the principal names here are what end up in the certificate.
 */
#[derive(Debug)]
pub struct UserRecord {
    pub name: String,
    pub public_keys: Vec<PublicKey>,
    pub fingerprints: Vec<Fingerprint>,
    pub oidc_subject: Option<String>,
    pub principals: Vec<String>,
}

/**
 * Certificate issuance policy shared by every session.
 */
#[derive(Debug)]
pub struct IssuerPolicy {
    pub validity: Duration,
    pub organisation: String,
    pub banner: String,
    pub extensions: Vec<String>,
}

/**
 * Lookup maps over the configured users, built once at load time and
 * read-only afterwards.  Uniqueness of fingerprints and subjects across
 * records is enforced during construction.
 */
#[derive(Debug, Default)]
pub struct PrincipalDirectory {
    by_fingerprint: BTreeMap<Fingerprint, Arc<UserRecord>>,
    by_subject: HashMap<String, Arc<UserRecord>>,
}

impl PrincipalDirectory {
    pub fn lookup_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Option<Arc<UserRecord>> {
        self.by_fingerprint.get(fingerprint).cloned()
    }

    pub fn lookup_by_subject(&self, subject: &str) -> Option<Arc<UserRecord>> {
        self.by_subject.get(subject).cloned()
    }
}

pub struct Config {
    pub policy: IssuerPolicy,
    pub directory: PrincipalDirectory,
    pub oidc: Option<OidcSettings>,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let p = path.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| anyhow!("reading {p:?}: {e}"))?;
        Settings::parse(&s)?.build()
    }

    pub fn parse(s: &str) -> Result<Settings> {
        Ok(serde_yaml::from_str(s)?)
    }

    /**
     * Validate the document and produce the immutable pieces the server
     * shares between sessions.  All of the checks here run at load time;
     * nothing about a user record is re-validated per connection.
     */
    pub fn build(self) -> Result<Config> {
        if self.user_principals.is_empty() {
            bail!("no users found in settings");
        }

        if self.validity < MIN_VALIDITY {
            bail!(
                "validity {} is below the minimum of {}",
                humantime::format_duration(self.validity),
                humantime::format_duration(MIN_VALIDITY),
            );
        }
        if self.validity > MAX_VALIDITY {
            bail!(
                "validity {} is above the maximum of {}",
                humantime::format_duration(self.validity),
                humantime::format_duration(MAX_VALIDITY),
            );
        }

        for (name, value) in &self.extensions {
            if !PERMITTED_EXTENSIONS.contains(&name.as_str()) {
                bail!("extension {name:?} is not permitted");
            }
            if !value.is_empty() {
                bail!(
                    "extension {name:?} must have an empty value, \
                    not {value:?}"
                );
            }
        }

        let mut directory = PrincipalDirectory::default();
        let mut need_oidc = false;

        for entry in &self.user_principals {
            if entry.name.is_empty() {
                bail!("user provided with empty name");
            }
            if entry.principals.is_empty() {
                bail!("user {} provided with no principals", entry.name);
            }

            let mut public_keys = Vec::new();
            let mut fingerprints = Vec::new();

            if let Some(blob) = &entry.authorized_key {
                let key = parse_authorized_key(blob)
                    .map_err(|e| anyhow!("user {}: {e}", entry.name))?;
                let fingerprint = key.fingerprint(HashAlg::Sha256);

                if let Some(want) = &entry.fingerprint {
                    let want = parse_fingerprint(want)
                        .map_err(|e| anyhow!("user {}: {e}", entry.name))?;
                    if want != fingerprint {
                        bail!(
                            "user {} has mismatched fingerprint and \
                            public key",
                            entry.name,
                        );
                    }
                }

                public_keys.push(key);
                fingerprints.push(fingerprint);
            } else if let Some(s) = &entry.fingerprint {
                fingerprints.push(
                    parse_fingerprint(s)
                        .map_err(|e| anyhow!("user {}: {e}", entry.name))?,
                );
            }

            if fingerprints.is_empty() && entry.oidc_subject.is_none() {
                bail!(
                    "user {} has no authorized_key, fingerprint, or \
                    oidc_subject",
                    entry.name,
                );
            }
            if entry.oidc_subject.is_some() {
                need_oidc = true;
            }

            let record = Arc::new(UserRecord {
                name: entry.name.clone(),
                public_keys,
                fingerprints,
                oidc_subject: entry.oidc_subject.clone(),
                principals: entry.principals.clone(),
            });

            for fingerprint in &record.fingerprints {
                if directory
                    .by_fingerprint
                    .insert(fingerprint.clone(), Arc::clone(&record))
                    .is_some()
                {
                    bail!(
                        "duplicate fingerprint {fingerprint} (user {})",
                        record.name,
                    );
                }
            }
            if let Some(subject) = &record.oidc_subject {
                if directory
                    .by_subject
                    .insert(subject.clone(), Arc::clone(&record))
                    .is_some()
                {
                    bail!(
                        "duplicate oidc_subject {subject:?} (user {})",
                        record.name,
                    );
                }
            }
        }

        if need_oidc && self.oidc.is_none() {
            bail!("oidc authorization used but oidc provider not configured");
        }

        Ok(Config {
            policy: IssuerPolicy {
                validity: self.validity,
                organisation: self.organisation,
                banner: self.banner,
                extensions: self.extensions.into_keys().collect(),
            },
            directory,
            oidc: self.oidc,
        })
    }
}

/**
 * Parse an authorized_keys-formatted blob that must contain exactly one
 * public key.
 */
fn parse_authorized_key(blob: &str) -> Result<PublicKey> {
    let mut keys = Vec::new();
    for entry in AuthorizedKeys::new(blob.trim()) {
        let entry = entry.map_err(|e| anyhow!("parsing authorized_key: {e}"))?;
        keys.push(entry.public_key().clone());
    }
    if keys.len() != 1 {
        bail!(
            "expected exactly one key in authorized_key entry, found {}",
            keys.len(),
        );
    }
    Ok(keys.remove(0))
}

fn parse_fingerprint(s: &str) -> Result<Fingerprint> {
    if s.len() != FINGERPRINT_LENGTH {
        bail!(
            "fingerprint must be {FINGERPRINT_LENGTH} characters, \
            found {}",
            s.len(),
        );
    }
    if !s.starts_with(FINGERPRINT_PREFIX) {
        bail!("fingerprint must begin with {FINGERPRINT_PREFIX}");
    }
    s.parse().map_err(|e| anyhow!("parsing fingerprint: {e}"))
}
