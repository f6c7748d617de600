pub mod abs;
pub mod directory;
pub mod s3;
pub mod xml;

use std::time::Duration;

use kvbackup_common::backend::StorageBackend;
use kvbackup_common::documents::{BackupSpec, StorageType};

use crate::error::BackupError;

use self::abs::{AbsBackend, AbsConfig, AbsCredential};
use self::directory::DirectoryBackend;
use self::s3::{S3Backend, S3Config, MIN_PART_SIZE};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Percent-encode each `/`-separated segment of an object key.
pub(crate) fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// HTTP client shared by every remote backend built by the operator.
pub fn http_client() -> Result<reqwest::Client, BackupError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| BackupError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Construct the storage backend a backup spec asks for.
///
/// Credentials missing from the backup spec are read from the environment
/// (`AZURE_STORAGE_ACCOUNT_KEY`, `AZURE_STORAGE_SAS_TOKEN`,
/// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`).
pub fn from_spec(
    spec: &BackupSpec,
    client: reqwest::Client,
    chunk_size: usize,
) -> Result<Box<dyn StorageBackend>, BackupError> {
    let storage_type: StorageType = spec
        .storage_type
        .parse()
        .map_err(|e| BackupError::Config(format!("backup '{}': {}", spec.name, e)))?;
    let missing = |section: &str| {
        BackupError::Config(format!(
            "backup '{}': storage type {} requires a [{}] section",
            spec.name, storage_type, section
        ))
    };

    match storage_type {
        StorageType::Abs => {
            let source = spec.abs.as_ref().ok_or_else(|| missing("abs"))?;
            let account_key = non_empty(source.account_key.clone())
                .or_else(|| env_var("AZURE_STORAGE_ACCOUNT_KEY"));
            let sas_token = non_empty(source.sas_token.clone())
                .or_else(|| env_var("AZURE_STORAGE_SAS_TOKEN"));

            let credential = match (account_key, sas_token) {
                (Some(key), _) => AbsCredential::shared_key(&key).map_err(|e| {
                    BackupError::Config(format!(
                        "backup '{}': account key is not valid base64: {}",
                        spec.name, e
                    ))
                })?,
                (None, Some(token)) => AbsCredential::sas(&token),
                (None, None) => {
                    return Err(BackupError::Config(format!(
                        "ABS credentials not found for backup '{}'",
                        spec.name
                    )))
                }
            };

            Ok(Box::new(AbsBackend::new(
                AbsConfig {
                    account_name: source.account_name.clone(),
                    container: source.container.clone(),
                    credential,
                    endpoint: source.endpoint.clone(),
                },
                client,
            )))
        }
        StorageType::S3 => {
            let source = spec.s3.as_ref().ok_or_else(|| missing("s3"))?;
            let access_key_id = non_empty(source.access_key_id.clone())
                .or_else(|| env_var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_default();
            let secret_access_key = non_empty(source.secret_access_key.clone())
                .or_else(|| env_var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_default();

            if access_key_id.is_empty() || secret_access_key.is_empty() {
                return Err(BackupError::Config(format!(
                    "S3 credentials not found for backup '{}'",
                    spec.name
                )));
            }
            if chunk_size < MIN_PART_SIZE {
                return Err(BackupError::Config(format!(
                    "backup '{}': S3 parts must be at least {} bytes, chunk size is {}",
                    spec.name, MIN_PART_SIZE, chunk_size
                )));
            }

            Ok(Box::new(S3Backend::new(
                S3Config {
                    bucket: source.bucket.clone(),
                    region: source.region.clone(),
                    endpoint: source.endpoint.clone(),
                    access_key_id,
                    secret_access_key,
                },
                client,
            )))
        }
        StorageType::Directory => {
            let source = spec.directory.as_ref().ok_or_else(|| missing("directory"))?;
            Ok(Box::new(DirectoryBackend::new(&source.path)))
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn env_var(name: &str) -> Option<String> {
    non_empty(std::env::var(name).ok())
}
