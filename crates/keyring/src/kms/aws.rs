//! AWS KMS client.

use std::fmt::Debug;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use tracing::debug;
use zeroize::Zeroizing;

use super::{DataKey, KmsClient, KmsError};

/// [`KmsClient`] backed by AWS KMS.
///
/// Credentials come from the standard AWS credential chain. An explicit
/// endpoint may be supplied for VPC endpoints or local KMS emulators.
#[derive(Clone, Debug)]
pub struct AwsKms {
    client: aws_sdk_kms::Client,
}

impl AwsKms {
    /// Load the shared SDK config and build a KMS client.
    pub async fn init(endpoint: Option<&str>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let mut builder = aws_sdk_kms::config::Builder::from(&config);
        if let Some(url) = endpoint {
            debug!(endpoint = %url, "using explicit KMS endpoint");
            builder = builder.endpoint_url(url);
        }

        Self {
            client: aws_sdk_kms::Client::from_conf(builder.build()),
        }
    }

    /// Wrap an already-configured SDK client.
    pub fn from_client(client: aws_sdk_kms::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KmsClient for AwsKms {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let resp = self
            .client
            .encrypt()
            .key_id(key_id)
            .plaintext(Blob::new(plaintext.to_vec()))
            .send()
            .await
            .map_err(|e| classify("encrypt", e))?;

        resp.ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| KmsError::InvalidResponse("encrypt response had no ciphertext".into()))
    }

    async fn decrypt(
        &self,
        key_id: &str,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let resp = self
            .client
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .send()
            .await
            .map_err(|e| classify("decrypt", e))?;

        resp.plaintext()
            .map(|b| Zeroizing::new(b.as_ref().to_vec()))
            .ok_or_else(|| KmsError::InvalidResponse("decrypt response had no plaintext".into()))
    }

    async fn generate_data_key(&self, key_id: &str) -> Result<DataKey, KmsError> {
        let resp = self
            .client
            .generate_data_key()
            .key_id(key_id)
            .key_spec(DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| classify("generate_data_key", e))?;

        let plaintext = resp
            .plaintext()
            .map(|b| Zeroizing::new(b.as_ref().to_vec()))
            .ok_or_else(|| KmsError::InvalidResponse("data key response had no plaintext".into()))?;
        let ciphertext = resp
            .ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| KmsError::InvalidResponse("data key response had no ciphertext".into()))?;

        Ok(DataKey {
            plaintext,
            ciphertext,
        })
    }
}

fn classify<E, R>(op: &'static str, err: SdkError<E, R>) -> KmsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    let code = err.code().map(str::to_owned);
    classify_code(code.as_deref(), format!("{op}: {}", DisplayErrorContext(&err)))
}

/// Map an AWS KMS error code to the boundary taxonomy.
///
/// Anything not recognised as a key, permission or ciphertext problem is
/// treated as transient: throttling, `KMSInternalException`,
/// `DependencyTimeoutException`, and dispatch/timeout failures with no code.
fn classify_code(code: Option<&str>, message: String) -> KmsError {
    match code {
        Some("NotFoundException") => KmsError::KeyNotFound(message),
        Some(
            "AccessDeniedException"
            | "DisabledException"
            | "KMSInvalidStateException"
            | "UnrecognizedClientException",
        ) => KmsError::AccessDenied(message),
        Some("InvalidCiphertextException" | "IncorrectKeyException" | "InvalidKeyUsageException") => {
            KmsError::InvalidCiphertext(message)
        }
        _ => KmsError::Transient(message),
    }
}
