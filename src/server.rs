use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::server::{Auth, Handle, Handler, Msg, Response, Session};
use russh::{
    Channel, ChannelId, CryptoVec, Disconnect, MethodKind, MethodSet, Pty,
};
use russh::keys::ssh_key::Fingerprint;
use russh::keys::{HashAlg, PrivateKey};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::agent;
use crate::cert;
use crate::config::{IssuerPolicy, PrincipalDirectory, UserRecord};
use crate::oidc::OidcClient;

/*
 * Once the handshake is complete and the certificate work has been done,
 * the client has this long to drive the session channel to a shell request
 * before the connection is torn down.
 */
const SESSION_DEADLINE: Duration = Duration::from_secs(10);

const RESULT_SUCCESS: &str =
    "certificate generation complete. Run 'ssh-add -l' to view";

/**
 * Immutable state shared by every connection: built once at startup,
 * read-only afterwards, so no locking is required.
 */
pub struct ServerState {
    pub directory: PrincipalDirectory,
    pub policy: IssuerPolicy,
    pub ca_key: PrivateKey,
    pub oidc: Option<OidcClient>,
}

/**
 * The identity a client proved during the handshake.  Authorization is
 * decided from this value alone; the login name the client claimed is
 * informational only.
 */
#[derive(Debug, Clone)]
enum ProvenIdentity {
    PublicKey(Fingerprint),
    OidcSubject(String),
}

impl fmt::Display for ProvenIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProvenIdentity::PublicKey(fp) => write!(f, "pubkey-fp={fp}"),
            ProvenIdentity::OidcSubject(sub) => write!(f, "oidc-sub={sub}"),
        }
    }
}

/*
 * The keyboard-interactive dialogue is a bounded request/reply exchange:
 * one instruction round carrying the browser URL and a single hidden
 * prompt, then the verification round.  A verified-but-unknown subject
 * gets one informational round before rejection.  There are no retries.
 */
enum KeyboardInteractive {
    Start,
    CodeRequested,
    Denied,
}

/**
 * Why certificate issuance failed.  The display text is what the remote
 * user sees; the sources carry the detail that goes to the log only.
 */
#[derive(Debug, Error)]
enum IssueError {
    #[error("could not open agent channel; connect using agent \
        forwarding (ssh -A)")]
    AgentChannel(#[source] russh::Error),

    #[error("certificate creation error")]
    Mint(#[source] anyhow::Error),

    #[error("certificate could not be added to the forwarded agent")]
    Inject(#[source] anyhow::Error),
}

fn reject() -> Auth {
    Auth::Reject { proceed_with_methods: None }
}

/**
 * Bind the listener and dispatch connections forever.  Each accepted
 * connection runs its handshake and session in its own task; nothing a
 * single connection does can take the listener down.
 */
pub async fn serve(
    ip: IpAddr,
    port: u16,
    host_key: PrivateKey,
    state: ServerState,
) -> Result<()> {
    let config = Arc::new(russh::server::Config {
        methods: MethodSet::from(
            &[MethodKind::PublicKey, MethodKind::KeyboardInteractive][..],
        ),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![host_key],
        ..Default::default()
    });
    let state = Arc::new(state);

    let listener = TcpListener::bind((ip, port))
        .await
        .with_context(|| format!("binding {ip}:{port}"))?;
    info!(
        organisation = %state.policy.organisation,
        "listening on {}",
        listener.local_addr().context("listener address")?,
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("failed to accept incoming connection: {e}");
                continue;
            }
        };
        debug!(%peer, "new tcp connection");

        let config = Arc::clone(&config);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let handler = ConnectionHandler::new(state, peer);
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!(%peer, "ssh session ended: {e}");
                    }
                }
                Err(e) => warn!(%peer, "ssh handshake failed: {e}"),
            }
        });
    }
}

/**
 * Per-connection handler state.  The authentication callbacks record who
 * the client proved to be; after that a worker task owns the certificate
 * pipeline and the terminal report, and the remaining callbacks only
 * sequence channel requests.
 */
struct ConnectionHandler {
    state: Arc<ServerState>,
    peer: SocketAddr,
    user: Option<Arc<UserRecord>>,
    identity: Option<ProvenIdentity>,
    kbd: KeyboardInteractive,
    shell_tx: Option<oneshot::Sender<ChannelId>>,
    session_opened: bool,
}

impl ConnectionHandler {
    fn new(state: Arc<ServerState>, peer: SocketAddr) -> ConnectionHandler {
        ConnectionHandler {
            state,
            peer,
            user: None,
            identity: None,
            kbd: KeyboardInteractive::Start,
            shell_tx: None,
            session_opened: false,
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        login: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        if self
            .state
            .directory
            .lookup_by_fingerprint(&fingerprint)
            .is_some()
        {
            return Ok(Auth::Accept);
        }
        debug!(
            peer = %self.peer,
            login,
            %fingerprint,
            "unknown public key offered",
        );
        Ok(reject())
    }

    async fn auth_publickey(
        &mut self,
        login: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        let Some(record) =
            self.state.directory.lookup_by_fingerprint(&fingerprint)
        else {
            debug!(peer = %self.peer, login, %fingerprint, "unknown key");
            return Ok(reject());
        };

        let identity = ProvenIdentity::PublicKey(fingerprint);
        info!(
            peer = %self.peer,
            user = %record.name,
            %identity,
            "public key authentication accepted",
        );
        self.identity = Some(identity);
        self.user = Some(record);
        Ok(Auth::Accept)
    }

    async fn auth_keyboard_interactive(
        &mut self,
        login: &str,
        _submethods: &str,
        response: Option<Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        let Some(oidc) = self.state.oidc.as_ref() else {
            debug!(
                peer = %self.peer,
                login,
                "keyboard-interactive attempted without oidc configured",
            );
            return Ok(reject());
        };

        match std::mem::replace(&mut self.kbd, KeyboardInteractive::Start) {
            KeyboardInteractive::Start => {
                self.kbd = KeyboardInteractive::CodeRequested;
                let instructions = format!(
                    "Visit this URL to obtain an auth code:\n{}\n",
                    oidc.auth_code_url(""),
                );
                Ok(Auth::Partial {
                    name: "".into(),
                    instructions: instructions.into(),
                    prompts: vec![("Enter your auth code: ".into(), false)]
                        .into(),
                })
            }
            KeyboardInteractive::CodeRequested => {
                let code = match response
                    .and_then(|r| r.into_iter().next().map(|a| a.to_vec()))
                {
                    Some(answer) => {
                        String::from_utf8_lossy(&answer).trim().to_string()
                    }
                    None => {
                        debug!(peer = %self.peer, login, "no auth code sent");
                        return Ok(reject());
                    }
                };

                let claims = match oidc.exchange(&code).await {
                    Ok(claims) => claims,
                    Err(e) => {
                        info!(
                            peer = %self.peer,
                            login,
                            "oidc exchange failed: {e:#}",
                        );
                        return Ok(reject());
                    }
                };

                match self.state.directory.lookup_by_subject(&claims.sub) {
                    Some(record) => {
                        let identity =
                            ProvenIdentity::OidcSubject(claims.sub);
                        info!(
                            peer = %self.peer,
                            user = %record.name,
                            %identity,
                            "keyboard-interactive authentication accepted",
                        );
                        self.identity = Some(identity);
                        self.user = Some(record);
                        Ok(Auth::Accept)
                    }
                    None => {
                        /*
                         * The token verified but the subject is not known
                         * here.  Tell the user who they proved to be, so
                         * an operator can add the subject to the settings,
                         * then reject on the next round.
                         */
                        info!(
                            peer = %self.peer,
                            login,
                            subject = %claims.sub,
                            "verified oidc subject is not authorized",
                        );
                        self.kbd = KeyboardInteractive::Denied;
                        Ok(Auth::Partial {
                            name: "".into(),
                            instructions: format!(
                                "Not authorized for this service: {}",
                                claims.sub,
                            )
                            .into(),
                            prompts: vec![].into(),
                        })
                    }
                }
            }
            KeyboardInteractive::Denied => Ok(reject()),
        }
    }

    async fn auth_succeeded(
        &mut self,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(user) = self.user.clone() else {
            /*
             * Authentication cannot succeed without one of our callbacks
             * having resolved a record; treat anything else as fatal for
             * this connection.
             */
            bail!("authentication succeeded without a resolved user");
        };
        if let Some(identity) = &self.identity {
            debug!(
                peer = %self.peer,
                user = %user.name,
                %identity,
                "handshake complete",
            );
        }

        let (shell_tx, shell_rx) = oneshot::channel();
        self.shell_tx = Some(shell_tx);

        tokio::spawn(run_session(
            session.handle(),
            Arc::clone(&self.state),
            user,
            shell_rx,
            self.peer,
        ));
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.session_opened {
            /*
             * The session is single shot: exactly one session channel is
             * serviced per connection.
             */
            debug!(peer = %self.peer, "rejecting additional session channel");
            return Ok(false);
        }
        self.session_opened = true;
        debug!(
            peer = %self.peer,
            channel = ?channel.id(),
            "session channel accepted",
        );
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            peer = %self.peer,
            target = %format!("{host_to_connect}:{port_to_connect}"),
            "rejecting direct-tcpip channel",
        );
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        /*
         * The client is announcing that it will accept our reverse
         * auth-agent@openssh.com channel open.
         */
        debug!(peer = %self.peer, "client offers agent forwarding");
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        if let Some(tx) = self.shell_tx.take() {
            let _ = tx.send(channel);
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_failure(channel);
        Ok(())
    }
}

/**
 * Per-connection worker.  The certificate work happens first, before the
 * session channel is serviced, so the terminal report next to a working
 * `ssh-add -l` reflects an injection that has already happened.  The
 * worker then waits, bounded by the session deadline, for the shell
 * request before emitting the result and closing.
 */
async fn run_session(
    handle: Handle,
    state: Arc<ServerState>,
    user: Arc<UserRecord>,
    shell_rx: oneshot::Receiver<ChannelId>,
    peer: SocketAddr,
) {
    let outcome = issue(&handle, &state, &user).await;
    if let Err(e) = &outcome {
        warn!(%peer, user = %user.name, "issuance failed: {e:?}");
    }

    let channel = match tokio::time::timeout(SESSION_DEADLINE, shell_rx).await
    {
        Ok(Ok(channel)) => channel,
        Ok(Err(_)) => {
            debug!(%peer, "connection closed before a shell request");
            return;
        }
        Err(_) => {
            debug!(%peer, "session deadline expired");
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "session timed out".to_string(),
                    String::new(),
                )
                .await;
            return;
        }
    };

    for line in state.policy.banner.lines() {
        term_write(&handle, channel, line).await;
    }
    term_write(&handle, channel, &format!("welcome, {}", user.name)).await;
    let failed = match &outcome {
        Ok(()) => {
            term_write(&handle, channel, RESULT_SUCCESS).await;
            false
        }
        Err(e) => {
            term_write(&handle, channel, &e.to_string()).await;
            true
        }
    };
    term_write(&handle, channel, "goodbye").await;

    /*
     * The exit-status reply goes out strictly before the channel closes,
     * and the session is single shot, so the connection goes down with
     * the channel.
     */
    let status = if failed { 1 } else { 0 };
    let _ = handle.exit_status_request(channel, status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
    let _ = handle
        .disconnect(
            Disconnect::ByApplication,
            "goodbye".to_string(),
            String::new(),
        )
        .await;
    info!(%peer, user = %user.name, status, "session complete");
}

/**
 * The issuance pipeline: open the reverse agent channel, mint, inject.
 * The early channel open catches clients that connected without agent
 * forwarding before any key material is generated.
 */
async fn issue(
    handle: &Handle,
    state: &ServerState,
    user: &UserRecord,
) -> Result<(), IssueError> {
    let agent_channel = handle
        .channel_open_agent()
        .await
        .map_err(IssueError::AgentChannel)?;

    let issued = cert::mint(user, &state.policy, &state.ca_key)
        .map_err(IssueError::Mint)?;

    let comment = format!(
        "{}_{}_expires_{}",
        state.policy.organisation,
        user.name,
        issued.certificate.valid_before(),
    );
    let lifetime =
        state.policy.validity.as_secs().try_into().unwrap_or(u32::MAX);

    let mut stream = agent_channel.into_stream();
    agent::add_certificate(
        &mut stream,
        &issued.private_key,
        &issued.certificate,
        &comment,
        lifetime,
    )
    .await
    .map_err(IssueError::Inject)?;

    info!(
        user = %user.name,
        serial = issued.certificate.serial(),
        key_id = %issued.certificate.key_id(),
        "certificate injected into forwarded agent",
    );
    Ok(())
}

/*
 * Write one line to the session terminal, ignoring errors; a client that
 * is gone will be noticed by the surrounding control flow.
 */
async fn term_write(handle: &Handle, channel: ChannelId, line: &str) {
    let _ = handle.data(channel, CryptoVec::from(format!("{line}\r\n"))).await;
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn identity_tags() {
        let fp: Fingerprint =
            "SHA256:tp0xT/Zpi2fT0hjjr6ht2LOHP7FyE8NCpaKenal4cCY"
                .parse()
                .unwrap();
        assert_eq!(
            ProvenIdentity::PublicKey(fp).to_string(),
            "pubkey-fp=SHA256:tp0xT/Zpi2fT0hjjr6ht2LOHP7FyE8NCpaKenal4cCY",
        );
        assert_eq!(
            ProvenIdentity::OidcSubject("abc-123".into()).to_string(),
            "oidc-sub=abc-123",
        );
    }

    #[test]
    fn issue_errors_keep_detail_out_of_user_text() {
        let e = IssueError::Mint(anyhow!("rng exploded in detail"));
        assert_eq!(e.to_string(), "certificate creation error");

        let e = IssueError::Inject(anyhow!("agent said something specific"));
        assert!(!e.to_string().contains("specific"));
    }
}
