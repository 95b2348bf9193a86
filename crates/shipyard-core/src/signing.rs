//! Image signing and signature verification.
//!
//! cosign runs inside the signing container. Images are always signed by
//! digest, never by tag. Every cosign call goes through the retry policy,
//! and only stderr classified as transient is retried.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_tools::{run_with_retries, CommandRunner, Invocation, RetryPolicy, ToolError};
use tracing::{debug, error, warn};

use crate::builder::DockerRegistry;
use crate::error::{Result, ShipyardError};
use crate::obs;

const PUBLIC_KEY_ENV: &str = "OPERATOR_PUBLIC_KEY";

/// Signing configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Container image that ships cosign and the PKCS#11 module
    pub signing_image: String,
    /// PKCS#11 key URI used by `cosign sign`
    pub pkcs11_uri: Option<String>,
    /// Signing service credentials
    pub grs_username: Option<String>,
    #[serde(skip_serializing)]
    pub grs_password: Option<String>,
    /// Where the verification public key is published
    pub public_key_url: String,
    /// Docker client config mounted into the signing container
    pub docker_config: String,
    #[serde(skip)]
    pub sign_retry: RetryPolicy,
    #[serde(skip)]
    pub verify_retry: RetryPolicy,
}

impl Default for SigningConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        SigningConfig {
            signing_image: std::env::var("SIGNING_IMAGE_URI").unwrap_or_else(|_| {
                "artifactory.corp.mongodb.com/release-tools-container-registry-local/garasign-cosign"
                    .to_string()
            }),
            pkcs11_uri: std::env::var("PKCS11_URI").ok(),
            grs_username: std::env::var("GRS_USERNAME").ok(),
            grs_password: std::env::var("GRS_PASSWORD").ok(),
            public_key_url: std::env::var("SIGNING_PUBLIC_KEY_URL").unwrap_or_else(|_| {
                "https://cosign.mongodb.com/mongodb-enterprise-kubernetes-operator.pem".to_string()
            }),
            docker_config: format!("{home}/.docker/config.json"),
            sign_retry: RetryPolicy::signing(),
            verify_retry: RetryPolicy::verification(),
        }
    }
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("signing_image", &self.signing_image)
            .field("pkcs11_uri", &self.pkcs11_uri)
            .field("grs_username", &self.grs_username)
            .field("grs_password", &self.grs_password.as_ref().map(|_| "***"))
            .field("public_key_url", &self.public_key_url)
            .field("docker_config", &self.docker_config)
            .finish()
    }
}

impl SigningConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_credentials(mut self, username: &str, password: &str, pkcs11_uri: &str) -> Self {
        self.grs_username = Some(username.to_string());
        self.grs_password = Some(password.to_string());
        self.pkcs11_uri = Some(pkcs11_uri.to_string());
        self
    }

    pub fn with_retry(mut self, sign: RetryPolicy, verify: RetryPolicy) -> Self {
        self.sign_retry = sign;
        self.verify_retry = verify;
        self
    }

    fn credentials(&self) -> Result<(&str, &str, &str)> {
        match (&self.grs_username, &self.grs_password, &self.pkcs11_uri) {
            (Some(user), Some(pass), Some(uri)) => Ok((user, pass, uri)),
            _ => Err(ShipyardError::Configuration(
                "signing needs GRS_USERNAME, GRS_PASSWORD and PKCS11_URI".to_string(),
            )),
        }
    }
}

/// Where the verification key comes from.
#[async_trait]
pub trait PublicKeySource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// Public key downloaded over HTTPS.
pub struct HttpPublicKey {
    url: String,
    client: reqwest::Client,
}

impl HttpPublicKey {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shipyard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl PublicKeySource for HttpPublicKey {
    async fn fetch(&self) -> Result<String> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(ShipyardError::Http(format!(
                "GET {} returned {}",
                self.url,
                response.status()
            )));
        }
        Ok(response.text().await?)
    }
}

/// A key supplied up front (local file, tests).
pub struct StaticPublicKey(pub String);

#[async_trait]
impl PublicKeySource for StaticPublicKey {
    async fn fetch(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Signs and verifies images with cosign.
pub struct Signer {
    runner: Arc<dyn CommandRunner>,
    config: SigningConfig,
    public_key: Arc<dyn PublicKeySource>,
}

impl Signer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: SigningConfig,
        public_key: Arc<dyn PublicKeySource>,
    ) -> Self {
        Self {
            runner,
            config,
            public_key,
        }
    }

    /// Signer fetching the key from `config.public_key_url`.
    pub fn from_config(runner: Arc<dyn CommandRunner>, config: SigningConfig) -> Result<Self> {
        let public_key = Arc::new(HttpPublicKey::new(&config.public_key_url)?);
        Ok(Self::new(runner, config, public_key))
    }

    pub fn config(&self) -> &SigningConfig {
        &self.config
    }

    fn cosign(&self, container_args: Vec<String>, cosign_args: Vec<String>) -> Invocation {
        Invocation::new("docker")
            .args([
                "run".to_string(),
                "--platform".to_string(),
                "linux/amd64".to_string(),
                "--rm".to_string(),
                format!(
                    "--volume={}:/root/.docker/config.json:ro",
                    self.config.docker_config
                ),
            ])
            .args(container_args)
            .args([self.config.signing_image.clone(), "cosign".to_string()])
            .args(cosign_args)
    }

    /// Resolve `repository:tag` to its digest, retrying transient failures.
    pub async fn resolve_digest(&self, repository: &str, tag: &str) -> Result<String> {
        let image = format!("{repository}:{tag}");
        let out = run_with_retries(
            self.runner.as_ref(),
            &DockerRegistry::digest_invocation(&image),
            &self.config.sign_retry,
        )
        .await?;
        DockerRegistry::parse_digest(&out.stdout)
    }

    /// Sign `repository:tag` by digest. Returns the signed `repository@digest`.
    pub async fn sign(&self, repository: &str, tag: &str) -> Result<String> {
        let (user, pass, pkcs11_uri) = self.config.credentials()?;
        let image = format!("{repository}:{tag}");
        let digest = self.resolve_digest(repository, tag).await?;
        let image_ref = format!("{repository}@{digest}");
        debug!(image = %image, image_ref = %image_ref, "signing");

        // One credentials file per invocation; removed when `env_file` drops.
        let mut env_file = tempfile::Builder::new()
            .prefix("shipyard-cosign-")
            .suffix(".env")
            .tempfile()?;
        writeln!(env_file, "GRS_CONFIG_USER1_USERNAME={user}")?;
        writeln!(env_file, "GRS_CONFIG_USER1_PASSWORD={pass}")?;
        writeln!(env_file, "COSIGN_REPOSITORY={repository}")?;
        env_file.flush()?;

        let inv = self.cosign(
            vec![format!("--env-file={}", env_file.path().display())],
            vec![
                "sign".to_string(),
                format!("--key={pkcs11_uri}"),
                format!("--sign-container-identity={image}"),
                "--tlog-upload=false".to_string(),
                image_ref.clone(),
            ],
        );
        run_with_retries(self.runner.as_ref(), &inv, &self.config.sign_retry).await?;
        drop(env_file);

        obs::emit_image_signed(&image_ref);
        Ok(image_ref)
    }

    /// Verify the signature of `repository:tag`.
    ///
    /// Fails closed: an unreachable public key or a non-transient cosign
    /// failure is `Ok(false)`. Exhausted retries are a `TransientNetwork` error.
    pub async fn verify(&self, repository: &str, tag: &str) -> Result<bool> {
        let image = format!("{repository}:{tag}");
        let key = match self.public_key.fetch().await {
            Ok(key) => key,
            Err(e) => {
                warn!(image = %image, error = %e, "cannot fetch signing public key");
                obs::emit_image_verified(&image, false);
                return Ok(false);
            }
        };

        let inv = self
            .cosign(
                vec!["--env".to_string(), PUBLIC_KEY_ENV.to_string()],
                vec![
                    "verify".to_string(),
                    "--insecure-ignore-tlog=true".to_string(),
                    format!("--key=env://{PUBLIC_KEY_ENV}"),
                    image.clone(),
                ],
            )
            .env(PUBLIC_KEY_ENV, key);

        let verified = match run_with_retries(self.runner.as_ref(), &inv, &self.config.verify_retry)
            .await
        {
            Ok(_) => true,
            Err(ToolError::Failed { stderr, .. }) => {
                error!(image = %image, stderr = %stderr.trim(), "signature verification failed");
                false
            }
            Err(e) => return Err(e.into()),
        };
        obs::emit_image_verified(&image, verified);
        Ok(verified)
    }

    /// Sign, then verify; a failed verification is a `Verification` error.
    pub async fn sign_and_verify(&self, repository: &str, tag: &str) -> Result<String> {
        let signed = self.sign(repository, tag).await?;
        if !self.verify(repository, tag).await? {
            return Err(ShipyardError::Verification(format!("{repository}:{tag}")));
        }
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_tools::fakes::ScriptedRunner;
    use shipyard_tools::CommandOutput;
    use std::time::Duration;

    struct UnreachableKey;

    #[async_trait]
    impl PublicKeySource for UnreachableKey {
        async fn fetch(&self) -> Result<String> {
            Err(ShipyardError::Http("GET key returned 404 Not Found".to_string()))
        }
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("***"));
        assert!(!rendered.contains("hunter2"));
    }

    fn config() -> SigningConfig {
        SigningConfig {
            signing_image: "registry.local/cosign".to_string(),
            pkcs11_uri: None,
            grs_username: None,
            grs_password: None,
            public_key_url: "https://keys.local/op.pem".to_string(),
            docker_config: "/home/ci/.docker/config.json".to_string(),
            sign_retry: RetryPolicy::signing(),
            verify_retry: RetryPolicy::verification(),
        }
        .with_credentials("svc", "hunter2", "pkcs11:token=ci")
    }

    fn runner_with_digest() -> Arc<ScriptedRunner> {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "imagetools inspect",
            CommandOutput::ok(r#"{"digest":"sha256:0123abcd"}"#),
        );
        runner
    }

    fn signer(runner: Arc<ScriptedRunner>, key: Arc<dyn PublicKeySource>) -> Signer {
        Signer::new(runner, config(), key)
    }

    #[tokio::test(start_paused = true)]
    async fn signs_by_digest() {
        let runner = runner_with_digest();
        let s = signer(runner.clone(), Arc::new(StaticPublicKey("KEY".into())));

        let signed = s.sign("quay.io/mongodb/operator", "1.2.0").await.unwrap();
        assert_eq!(signed, "quay.io/mongodb/operator@sha256:0123abcd");

        let sign_call = runner
            .command_lines()
            .into_iter()
            .find(|l| l.contains("cosign sign"))
            .unwrap();
        assert!(sign_call.starts_with("docker run --platform linux/amd64 --rm"));
        assert!(sign_call.contains("--key=pkcs11:token=ci"));
        assert!(sign_call.contains("--sign-container-identity=quay.io/mongodb/operator:1.2.0"));
        assert!(sign_call.contains("--tlog-upload=false"));
        assert!(sign_call.ends_with("quay.io/mongodb/operator@sha256:0123abcd"));
        assert!(!sign_call.contains("hunter2"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_signs_use_distinct_credential_files() {
        let runner = runner_with_digest();
        let s = Arc::new(signer(runner.clone(), Arc::new(StaticPublicKey("K".into()))));
        let (a, b) = tokio::join!(s.sign("quay.io/a", "1"), s.sign("quay.io/b", "1"));
        a.unwrap();
        b.unwrap();

        let env_files: Vec<String> = runner
            .command_lines()
            .iter()
            .flat_map(|l| l.split(' ').map(str::to_string).collect::<Vec<_>>())
            .filter(|arg| arg.starts_with("--env-file="))
            .collect();
        assert_eq!(env_files.len(), 2);
        assert_ne!(env_files[0], env_files[1]);
        // Files are gone once signing returns.
        for arg in env_files {
            let path = arg.trim_start_matches("--env-file=");
            assert!(!std::path::Path::new(path).exists());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sign_retries_exactly_policy_attempts() {
        let runner = runner_with_digest();
        runner.on("cosign sign", CommandOutput::failed(1, "Error: 503 Service Unavailable"));
        let s = signer(runner.clone(), Arc::new(StaticPublicKey("K".into())));

        let err = s.sign("quay.io/mongodb/operator", "1.2.0").await.unwrap_err();
        assert_eq!(err.kind(), "TransientNetworkError");
        assert_eq!(runner.count_matching("cosign sign"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_succeeds_on_final_attempt() {
        let runner = runner_with_digest();
        runner.on_sequence(
            "cosign sign",
            (0..5).map(|_| CommandOutput::failed(1, "429 Too Many Requests")),
        );
        let s = signer(runner.clone(), Arc::new(StaticPublicKey("K".into())));

        let start = tokio::time::Instant::now();
        s.sign("quay.io/mongodb/operator", "1.2.0").await.unwrap();
        assert_eq!(runner.count_matching("cosign sign"), 6);
        // 10+20+40+80+160 seconds of backoff, plus jitter under 1s each.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(310));
        assert!(waited < Duration::from_secs(316));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_sign_failure_propagates_immediately() {
        let runner = runner_with_digest();
        runner.on("cosign sign", CommandOutput::failed(1, "error: signing key not found"));
        let s = signer(runner.clone(), Arc::new(StaticPublicKey("K".into())));

        let err = s.sign("quay.io/mongodb/operator", "1.2.0").await.unwrap_err();
        assert_eq!(err.kind(), "ToolError");
        assert_eq!(runner.count_matching("cosign sign"), 1);
    }

    #[tokio::test]
    async fn missing_credentials_is_configuration_error() {
        let runner = runner_with_digest();
        let mut cfg = config();
        cfg.pkcs11_uri = None;
        let s = Signer::new(runner.clone(), cfg, Arc::new(StaticPublicKey("K".into())));
        let err = s.sign("quay.io/x", "1").await.unwrap_err();
        assert!(matches!(err, ShipyardError::Configuration(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn verify_passes_key_through_environment() {
        let runner = runner_with_digest();
        let s = signer(runner.clone(), Arc::new(StaticPublicKey("-----BEGIN KEY-----".into())));

        assert!(s.verify("quay.io/mongodb/operator", "1.2.0").await.unwrap());
        let call = runner.calls().into_iter().find(|c| c.command_line().contains("cosign verify")).unwrap();
        assert!(call.command_line().contains("--key=env://OPERATOR_PUBLIC_KEY"));
        assert!(call.command_line().ends_with("quay.io/mongodb/operator:1.2.0"));
        assert_eq!(
            call.env,
            vec![(PUBLIC_KEY_ENV.to_string(), "-----BEGIN KEY-----".to_string())]
        );
    }

    #[tokio::test]
    async fn verify_fails_closed_without_key() {
        let runner = runner_with_digest();
        let s = signer(runner.clone(), Arc::new(UnreachableKey));
        assert!(!s.verify("quay.io/mongodb/operator", "1.2.0").await.unwrap());
        assert_eq!(runner.count_matching("cosign verify"), 0);
    }

    #[tokio::test]
    async fn verify_bad_signature_is_false() {
        let runner = runner_with_digest();
        runner.on("cosign verify", CommandOutput::failed(1, "no matching signatures"));
        let s = signer(runner.clone(), Arc::new(StaticPublicKey("K".into())));
        assert!(!s.verify("quay.io/mongodb/operator", "1.2.0").await.unwrap());
        assert_eq!(runner.count_matching("cosign verify"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn verify_retries_ten_times() {
        let runner = runner_with_digest();
        runner.on("cosign verify", CommandOutput::failed(1, "i/o timeout"));
        let s = signer(runner.clone(), Arc::new(StaticPublicKey("K".into())));
        let err = s.verify("quay.io/mongodb/operator", "1.2.0").await.unwrap_err();
        assert_eq!(err.kind(), "TransientNetworkError");
        assert_eq!(runner.count_matching("cosign verify"), 10);
    }

    #[tokio::test]
    async fn sign_and_verify_turns_false_into_error() {
        let runner = runner_with_digest();
        runner.on("cosign verify", CommandOutput::failed(1, "no matching signatures"));
        let s = signer(runner, Arc::new(StaticPublicKey("K".into())));
        let err = s.sign_and_verify("quay.io/x", "1").await.unwrap_err();
        assert!(matches!(err, ShipyardError::Verification(_)));
    }
}
