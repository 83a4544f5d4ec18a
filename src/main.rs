//! SSH forwarded-agent certificate authority.
//!
//! This server accepts SSH connections from users listed in its settings
//! file, authenticated by public key or by an OpenID Connect auth-code
//! dialogue over keyboard-interactive.  For each recognised user it
//! generates an ephemeral key pair, signs a short-lived user certificate
//! for it with the CA key, and pushes both into the client's forwarded
//! SSH agent over the auth-agent@openssh.com back channel.  Hosts that
//! trust the CA public key then accept the certificate's principals for
//! login.
//!
//! Usage:
//!
//!   $ agentca -t host_key -c ca_key settings.yaml
//!   $ ssh -A -p 2222 ca.example.com

mod agent;
mod cert;
mod config;
mod oidc;
mod server;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use russh::keys::PrivateKey;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "SSH forwarded-agent certificate authority")]
struct Options {
    /// Server SSH host private key (may be passphrase protected).
    #[arg(short = 't', long)]
    private_key: PathBuf,

    /// Certificate authority private key (may be passphrase protected).
    #[arg(short = 'c', long)]
    ca_private_key: PathBuf,

    /// Address to listen on.
    #[arg(short = 'i', long, default_value = "0.0.0.0")]
    ip_address: IpAddr,

    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = 2222)]
    port: u16,

    /// Settings file with users, principals, and certificate policy.
    settings: PathBuf,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/*
 * Load an OpenSSH private key from disk.  An encrypted key triggers a
 * passphrase prompt on the controlling terminal and a decrypt retry.
 */
fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let key = PrivateKey::read_openssh_file(path)
        .map_err(|e| anyhow!("reading {path:?}: {e}"))?;
    if !key.is_encrypted() {
        return Ok(key);
    }

    let passphrase = rpassword::prompt_password(format!(
        "passphrase for {}: ",
        path.display(),
    ))
    .context("reading passphrase")?;
    key.decrypt(passphrase.as_bytes())
        .map_err(|e| anyhow!("decrypting {path:?}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Options::parse();

    let config = config::Settings::load(&options.settings)
        .with_context(|| format!("loading {:?}", options.settings))?;

    /*
     * Provider discovery makes an outbound connection; a misconfigured or
     * unreachable provider is a startup failure, not something to discover
     * on the first keyboard-interactive attempt.
     */
    let oidc = match &config.oidc {
        Some(settings) => Some(
            oidc::OidcClient::discover(settings)
                .await
                .context("initializing oidc provider")?,
        ),
        None => None,
    };

    let host_key = load_private_key(&options.private_key)
        .context("loading server private key")?;
    let ca_key = load_private_key(&options.ca_private_key)
        .context("loading certificate authority private key")?;

    server::serve(
        options.ip_address,
        options.port,
        host_key,
        server::ServerState {
            directory: config.directory,
            policy: config.policy,
            ca_key,
            oidc,
        },
    )
    .await
}
