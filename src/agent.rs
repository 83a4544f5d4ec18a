use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use ssh_encoding::Encode;
use russh::keys::ssh_key::private::{EcdsaKeypair, KeypairData};
use russh::keys::ssh_key::Mpint;
use russh::keys::{Algorithm, Certificate, PrivateKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/*
 * These constants are lifted from IETF "draft-miller-ssh-agent-14", which
 * covers the SSH Agent Protocol:
 */
const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;
const SSH_AGENT_FAILURE: u8 = 5;
const SSH_AGENT_SUCCESS: u8 = 6;
const SSH_AGENT_CONSTRAIN_LIFETIME: u8 = 1;

#[derive(Debug, Clone)]
enum AgentMessage {
    Failure,
    Success,
}

enum ClientMessage {
    /**
     * Add a certified private key to the agent, with a lifetime constraint
     * so that the agent forgets the key when the certificate expires.
     */
    AddCertifiedIdentity {
        algorithm: String,
        certificate: Vec<u8>,
        private: Mpint,
        comment: String,
        lifetime_secs: u32,
    },
}

impl ClientMessage {
    fn pack(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        match self {
            ClientMessage::AddCertifiedIdentity {
                algorithm,
                certificate,
                private,
                comment,
                lifetime_secs,
            } => {
                /*
                 * Encode the identity fields first so that the overall
                 * message length prefix can be computed:
                 */
                let mut body: Vec<u8> = Vec::new();
                algorithm.as_str().encode(&mut body)?;
                certificate.as_slice().encode(&mut body)?;
                private.encode(&mut body)?;
                comment.as_str().encode(&mut body)?;

                let len = 1 + body.len() + 1 + 4;
                buf.put_u32(len.try_into().unwrap());
                buf.put_u8(SSH_AGENTC_ADD_ID_CONSTRAINED);
                buf.extend_from_slice(&body);
                buf.put_u8(SSH_AGENT_CONSTRAIN_LIFETIME);
                buf.put_u32(*lifetime_secs);
            }
        }
        Ok(buf)
    }
}

enum State {
    Rest,
    Len(usize),
    Message(AgentMessage),
    Error,
}

struct PartialMessage {
    state: State,
    buf: BytesMut,
}

impl PartialMessage {
    fn new() -> PartialMessage {
        PartialMessage { buf: Default::default(), state: State::Rest }
    }

    fn add(&mut self, byt: u8) -> Result<()> {
        self.buf.put_u8(byt);

        match self.state {
            State::Error => {
                bail!("protocol error");
            }
            State::Rest => {
                if self.buf.len() > 4 {
                    self.state =
                        State::Len(self.buf.get_u32().try_into().unwrap());
                }
            }
            State::Len(len) => {
                if self.buf.len() == len {
                    /*
                     * We have the whole message.
                     */
                    if len == 0 {
                        self.state = State::Error;
                        bail!("zero-length message");
                    }
                    match self.buf.get_u8() {
                        SSH_AGENT_FAILURE => {
                            self.state = State::Message(AgentMessage::Failure);
                        }
                        SSH_AGENT_SUCCESS => {
                            self.state = State::Message(AgentMessage::Success);
                        }
                        n => {
                            self.state = State::Error;
                            bail!("unhandled message type {}", n);
                        }
                    }
                } else if self.buf.len() > len {
                    /*
                     * We have too much message!
                     */
                    self.state = State::Error;
                    bail!("too much message (wanted {} bytes)", len);
                }
            }
            State::Message(_) => {
                bail!("message without take()");
            }
        }

        Ok(())
    }

    fn take(&mut self) -> Option<AgentMessage> {
        let m = match &self.state {
            State::Message(m) => m.clone(),
            _ => return None,
        };
        self.state = State::Rest;
        self.buf.clear();
        Some(m)
    }
}

/**
 * Add a certified key to the agent on the far side of the stream.  Only
 * the ephemeral private key and its certificate travel here; the signing
 * key that produced the certificate is never part of any agent message.
 */
pub async fn add_certificate<S>(
    stream: &mut S,
    private_key: &PrivateKey,
    certificate: &Certificate,
    comment: &str,
    lifetime_secs: u32,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = ClientMessage::AddCertifiedIdentity {
        algorithm: certificate_algorithm(certificate)?,
        certificate: certificate.to_bytes()?,
        private: private_scalar(private_key)?,
        comment: comment.to_string(),
        lifetime_secs,
    };

    stream.write_all(&msg.pack()?).await?;

    let mut par = PartialMessage::new();
    loop {
        par.add(stream.read_u8().await?)?;
        if let Some(m) = par.take() {
            return match m {
                AgentMessage::Success => Ok(()),
                AgentMessage::Failure => {
                    bail!("agent refused to add the certificate");
                }
            };
        }
    }
}

/*
 * The wire name for a certified key of the given algorithm; the agent uses
 * it to decide how to parse the private key fields that follow.
 */
fn certificate_algorithm(certificate: &Certificate) -> Result<String> {
    match certificate.algorithm() {
        Algorithm::Ecdsa { curve } => {
            Ok(format!("ecdsa-sha2-{curve}-cert-v01@openssh.com"))
        }
        other => bail!("unsupported certificate algorithm {other}"),
    }
}

/*
 * The ECDSA private scalar, as the mpint the agent protocol expects.
 */
fn private_scalar(key: &PrivateKey) -> Result<Mpint> {
    match key.key_data() {
        KeypairData::Ecdsa(pair) => {
            let scalar = match pair {
                EcdsaKeypair::NistP256 { private, .. } => private.as_slice(),
                EcdsaKeypair::NistP384 { private, .. } => private.as_slice(),
                EcdsaKeypair::NistP521 { private, .. } => private.as_slice(),
            };
            Ok(Mpint::from_positive_bytes(scalar)?)
        }
        _ => bail!("unsupported key type for agent injection"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::OsRng;
    use russh::keys::ssh_key::certificate::{Builder, CertType};
    use russh::keys::EcdsaCurve;

    fn test_identity() -> (PrivateKey, Certificate) {
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let key = PrivateKey::random(
            &mut OsRng,
            Algorithm::Ecdsa { curve: EcdsaCurve::NistP384 },
        )
        .unwrap();

        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            key.public_key().key_data().clone(),
            0,
            0xffff_ffff,
        )
        .unwrap();
        builder.serial(7).unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.key_id("test").unwrap();
        builder.valid_principal("bob").unwrap();
        let certificate = builder.sign(&ca).unwrap();

        (key, certificate)
    }

    fn read_string(buf: &mut BytesMut) -> Vec<u8> {
        let len: usize = buf.get_u32().try_into().unwrap();
        let out = buf.get(0..len).unwrap().to_vec();
        buf.advance(len);
        out
    }

    #[test]
    fn packs_add_identity_frame() {
        let (key, certificate) = test_identity();
        let blob = certificate.to_bytes().unwrap();
        let msg = ClientMessage::AddCertifiedIdentity {
            algorithm: certificate_algorithm(&certificate).unwrap(),
            certificate: blob.clone(),
            private: private_scalar(&key).unwrap(),
            comment: "bob@test".to_string(),
            lifetime_secs: 600,
        };

        let mut buf = msg.pack().unwrap();

        let framed: usize = buf.get_u32().try_into().unwrap();
        assert_eq!(framed, buf.len());
        assert_eq!(buf.get_u8(), SSH_AGENTC_ADD_ID_CONSTRAINED);
        assert_eq!(
            read_string(&mut buf),
            b"ecdsa-sha2-nistp384-cert-v01@openssh.com",
        );
        assert_eq!(read_string(&mut buf), blob);

        /*
         * The mpint scalar: positive, so at most one leading zero octet,
         * and 48 bytes of key material for P-384.
         */
        let scalar = read_string(&mut buf);
        assert!(scalar.len() == 48 || scalar.len() == 49);
        if scalar.len() == 49 {
            assert_eq!(scalar[0], 0);
        }

        assert_eq!(read_string(&mut buf), b"bob@test");
        assert_eq!(buf.get_u8(), SSH_AGENT_CONSTRAIN_LIFETIME);
        assert_eq!(buf.get_u32(), 600);
        assert!(buf.is_empty());
    }

    #[test]
    fn parses_success_and_failure() {
        let mut par = PartialMessage::new();
        for byt in [0, 0, 0, 1, SSH_AGENT_SUCCESS] {
            par.add(byt).unwrap();
        }
        assert!(matches!(par.take(), Some(AgentMessage::Success)));

        /*
         * The same parser is reusable for the next message.
         */
        for byt in [0, 0, 0, 1, SSH_AGENT_FAILURE] {
            par.add(byt).unwrap();
        }
        assert!(matches!(par.take(), Some(AgentMessage::Failure)));
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut par = PartialMessage::new();
        for byt in [0, 0, 0, 1] {
            par.add(byt).unwrap();
        }
        assert!(par.add(99).is_err());
    }

    #[test]
    fn rejects_zero_length_message() {
        let mut par = PartialMessage::new();
        for byt in [0, 0, 0, 0] {
            par.add(byt).unwrap();
        }
        assert!(par.add(SSH_AGENT_SUCCESS).is_err());
    }

    /*
     * Drive add_certificate() against a fake agent on the far side of an
     * in-memory stream.
     */
    async fn fake_agent(
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        reply: u8,
    ) -> BytesMut {
        let len = stream.read_u32().await.unwrap();
        let mut request = vec![0u8; len.try_into().unwrap()];
        stream.read_exact(&mut request).await.unwrap();
        stream.write_all(&[0, 0, 0, 1, reply]).await.unwrap();
        BytesMut::from(request.as_slice())
    }

    #[tokio::test]
    async fn injects_into_accepting_agent() {
        let (mut near, mut far) = tokio::io::duplex(64 * 1024);
        let (key, certificate) = test_identity();

        let agent = tokio::spawn(async move {
            fake_agent(&mut far, SSH_AGENT_SUCCESS).await
        });

        add_certificate(&mut near, &key, &certificate, "bob@test", 600)
            .await
            .unwrap();

        let mut request = agent.await.unwrap();
        assert_eq!(request.get_u8(), SSH_AGENTC_ADD_ID_CONSTRAINED);
        assert_eq!(
            read_string(&mut request),
            b"ecdsa-sha2-nistp384-cert-v01@openssh.com",
        );
    }

    #[tokio::test]
    async fn reports_agent_refusal() {
        let (mut near, mut far) = tokio::io::duplex(64 * 1024);
        let (key, certificate) = test_identity();

        let agent = tokio::spawn(async move {
            fake_agent(&mut far, SSH_AGENT_FAILURE).await;
        });

        let err = add_certificate(&mut near, &key, &certificate, "x", 600)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refused"));

        agent.await.unwrap();
    }

    #[test]
    fn refuses_non_ecdsa_keys() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        assert!(private_scalar(&key).is_err());
    }
}
