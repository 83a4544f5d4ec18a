use anyhow::{Context, Result};
use rand::rngs::OsRng;
use russh::keys::ssh_key::certificate::{Builder, CertType};
use russh::keys::{Algorithm, Certificate, EcdsaCurve, PrivateKey};

use crate::config::{IssuerPolicy, UserRecord};

/*
 * Start the validity window slightly in the past to tolerate clock skew on
 * the hosts that will evaluate the certificate.
 */
const CLOCK_SKEW_SECS: u64 = 5;

/**
 * A freshly generated key pair and the certificate binding it to a user's
 * principals.  The private key exists only to be handed to the client's
 * forwarded agent; it is never written anywhere and is zeroized on drop.
 */
pub struct IssuedCertificate {
    pub private_key: PrivateKey,
    pub certificate: Certificate,
}

/**
 * Generate an ephemeral key pair and sign a user certificate for it with
 * the CA key.  The certificate carries exactly the user's configured
 * principals, the policy's extension set, a random serial, and a validity
 * window of the policy duration starting now.
 */
pub fn mint(
    user: &UserRecord,
    policy: &IssuerPolicy,
    ca_key: &PrivateKey,
) -> Result<IssuedCertificate> {
    /*
     * P-384 generation is fast; the choice is independent of the CA key
     * type, which signs whatever we generate here.
     */
    let private_key = PrivateKey::random(
        &mut OsRng,
        Algorithm::Ecdsa { curve: EcdsaCurve::NistP384 },
    )
    .context("generating ephemeral key")?;

    let valid_after = crate::now_secs().saturating_sub(CLOCK_SKEW_SECS);
    let valid_before = valid_after + policy.validity.as_secs();

    let mut builder = Builder::new_with_random_nonce(
        &mut OsRng,
        private_key.public_key().key_data().clone(),
        valid_after,
        valid_before,
    )
    .context("constructing certificate")?;

    builder.serial(rand::random::<u64>())?;
    builder.cert_type(CertType::User)?;
    builder.key_id(format!("{}_{}", policy.organisation, user.name))?;
    for principal in &user.principals {
        builder.valid_principal(principal)?;
    }
    for extension in &policy.extensions {
        builder.extension(extension, "")?;
    }

    let certificate = builder
        .sign(ca_key)
        .context("signing certificate with the CA key")?;

    Ok(IssuedCertificate { private_key, certificate })
}

#[cfg(test)]
mod test {
    use super::*;
    use russh::keys::HashAlg;
    use std::time::Duration;

    fn test_user() -> UserRecord {
        UserRecord {
            name: "bob".to_string(),
            public_keys: Vec::new(),
            fingerprints: Vec::new(),
            oidc_subject: None,
            principals: vec!["bob".to_string(), "admins".to_string()],
        }
    }

    fn test_policy() -> IssuerPolicy {
        IssuerPolicy {
            validity: Duration::from_secs(12 * 60 * 60),
            organisation: "acmecorp".to_string(),
            banner: String::new(),
            extensions: vec![
                "permit-agent-forwarding".to_string(),
                "permit-pty".to_string(),
            ],
        }
    }

    fn test_ca() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    #[test]
    fn populates_certificate_fields() {
        let policy = test_policy();
        let issued = mint(&test_user(), &policy, &test_ca()).unwrap();
        let c = &issued.certificate;

        assert_eq!(c.cert_type(), CertType::User);
        assert_eq!(c.valid_principals(), &["bob", "admins"]);
        assert_eq!(
            c.valid_before() - c.valid_after(),
            policy.validity.as_secs(),
        );
        assert_eq!(c.key_id(), "acmecorp_bob");
        assert_eq!(c.nonce().len(), 32);
        assert!(c.critical_options().iter().next().is_none());
        assert_eq!(
            c.extensions()
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect::<Vec<_>>(),
            vec![("permit-agent-forwarding", ""), ("permit-pty", "")],
        );
        assert!(matches!(
            issued.private_key.algorithm(),
            Algorithm::Ecdsa { curve: EcdsaCurve::NistP384 },
        ));
    }

    #[test]
    fn signature_verifies_under_ca_key() {
        let ca = test_ca();
        let issued = mint(&test_user(), &test_policy(), &ca).unwrap();
        let ca_fingerprint =
            ca.public_key().fingerprint(HashAlg::Sha256);

        issued
            .certificate
            .validate_at(crate::now_secs(), [&ca_fingerprint])
            .unwrap();

        /*
         * A different CA must not validate it.
         */
        let other = test_ca().public_key().fingerprint(HashAlg::Sha256);
        assert!(issued
            .certificate
            .validate_at(crate::now_secs(), [&other])
            .is_err());
    }

    #[test]
    fn successive_issuances_are_distinct() {
        let ca = test_ca();
        let user = test_user();
        let policy = test_policy();

        let a = mint(&user, &policy, &ca).unwrap();
        let b = mint(&user, &policy, &ca).unwrap();

        assert_ne!(a.certificate.serial(), b.certificate.serial());
        assert_ne!(a.certificate.nonce(), b.certificate.nonce());
        assert_eq!(
            a.certificate.valid_principals(),
            b.certificate.valid_principals(),
        );
        assert_eq!(
            a.certificate.extensions(),
            b.certificate.extensions(),
        );
    }
}
