//! Azure Blob Storage backend.
//!
//! Talks to the Blob REST API over reqwest. Requests are authorised either
//! with Shared Key (HMAC-SHA256 of the canonical request, keyed with the
//! decoded account key) or by appending a pre-issued SAS token. Backups are
//! block blobs: `Put Block` per chunk, then `Put Block List` as the commit.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use kvbackup_common::backend::{BackendError, ObjectEntry, StagedBlock, StorageBackend, UploadSession};
use reqwest::{Client, Method, Response};
use sha2::Sha256;
use tracing::{debug, warn};

use super::encode_key;
use super::xml::{self, extract_tag};

type HmacSha256 = Hmac<Sha256>;

const NAME: &str = "abs";
pub const API_VERSION: &str = "2019-12-12";
/// Largest block accepted by `Put Block` at this API version.
const MAX_BLOCK_SIZE: usize = 4000 * 1024 * 1024;

#[derive(Clone)]
pub enum AbsCredential {
    /// Decoded account key.
    SharedKey(Vec<u8>),
    /// Query string of a SAS token, without the leading `?`.
    Sas(String),
}

impl AbsCredential {
    pub fn shared_key(account_key: &str) -> Result<Self, base64::DecodeError> {
        Ok(AbsCredential::SharedKey(
            base64::engine::general_purpose::STANDARD.decode(account_key.trim())?,
        ))
    }

    pub fn sas(token: &str) -> Self {
        AbsCredential::Sas(crate::sas::strip_token(token).to_string())
    }
}

#[derive(Clone)]
pub struct AbsConfig {
    pub account_name: String,
    pub container: String,
    pub credential: AbsCredential,
    pub endpoint: Option<String>, // Emulator or sovereign cloud blob endpoint
}

pub struct AbsBackend {
    config: AbsConfig,
    client: Client,
}

impl AbsBackend {
    pub fn new(config: AbsConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(ep) => ep.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.config.account_name),
        }
    }

    /// URL path of the container or of a blob in it, including any path the
    /// endpoint itself carries.
    fn resource_path(&self, blob: Option<&str>) -> String {
        let base = url_path(&self.endpoint());
        match blob {
            Some(blob) => format!("{}/{}/{}", base, self.config.container, encode_key(blob)),
            None => format!("{}/{}", base, self.config.container),
        }
    }

    fn url(&self, path: &str, query: &BTreeMap<String, String>) -> String {
        let mut pairs: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        if let AbsCredential::Sas(token) = &self.config.credential {
            pairs.push(token.clone());
        }
        let origin = url_origin(&self.endpoint());
        if pairs.is_empty() {
            format!("{}{}", origin, path)
        } else {
            format!("{}{}?{}", origin, path, pairs.join("&"))
        }
    }

    /// Shared Key signature over the canonical request.
    fn sign(
        &self,
        key: &[u8],
        method: &str,
        path: &str,
        query: &BTreeMap<String, String>,
        headers: &BTreeMap<String, String>,
        content_length: usize,
    ) -> String {
        let string_to_sign = string_to_sign(
            &self.config.account_name,
            method,
            path,
            query,
            headers,
            content_length,
        );
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length ok");
        mac.update(string_to_sign.as_bytes());
        let signature =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        format!("SharedKey {}:{}", self.config.account_name, signature)
    }

    async fn send(
        &self,
        method: Method,
        blob: Option<&str>,
        query: &BTreeMap<String, String>,
        extra_headers: &[(&str, String)],
        body: Bytes,
    ) -> Result<Response, BackendError> {
        let path = self.resource_path(blob);
        let mut headers = BTreeMap::new();
        headers.insert(
            "x-ms-date".to_string(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        headers.insert("x-ms-version".to_string(), API_VERSION.to_string());
        for (name, value) in extra_headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }

        let mut req = self.client.request(method.clone(), self.url(&path, query));
        if let AbsCredential::SharedKey(key) = &self.config.credential {
            let auth = self.sign(key, method.as_str(), &path, query, &headers, body.len());
            req = req.header("Authorization", auth);
        }
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }

        req.body(body).send().await.map_err(|e| BackendError::Unavailable {
            backend: NAME,
            message: format!("ABS {} request failed: {}", method, e),
        })
    }
}

/// Build the Shared Key string-to-sign for the Blob service.
fn string_to_sign(
    account: &str,
    method: &str,
    path: &str,
    query: &BTreeMap<String, String>,
    headers: &BTreeMap<String, String>,
    content_length: usize,
) -> String {
    let header = |name: &str| headers.get(name).cloned().unwrap_or_default();
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let canonical_headers: String = headers
        .iter()
        .filter(|(k, _)| k.starts_with("x-ms-"))
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let mut canonical_resource = format!("/{}{}", account, path);
    for (k, v) in query {
        canonical_resource.push_str(&format!("\n{}:{}", k.to_ascii_lowercase(), v));
    }

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}{}",
        method,
        header("content-encoding"),
        header("content-language"),
        length,
        header("content-md5"),
        header("content-type"),
        "", // Date: x-ms-date is used instead
        header("if-modified-since"),
        header("if-match"),
        header("if-none-match"),
        header("if-unmodified-since"),
        header("range"),
        canonical_headers,
        canonical_resource
    )
}

fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn error_code(resp: &Response) -> String {
    resp.headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn error_from(resp: Response) -> BackendError {
    let status = resp.status().as_u16();
    let code = error_code(&resp);
    let body = resp.text().await.unwrap_or_default();
    let message = if code.is_empty() {
        body
    } else {
        format!("{}: {}", code, body)
    };
    BackendError::from_status(NAME, status, message)
}

/// `scheme://host[:port]` of a URL.
fn url_origin(url: &str) -> String {
    let (scheme, rest) = url.split_once("://").unwrap_or(("https", url));
    let host = rest.split('/').next().unwrap_or(rest);
    format!("{}://{}", scheme, host)
}

/// Path of a URL without trailing slash (empty for a bare origin).
fn url_path(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    match rest.find('/') {
        Some(pos) => rest[pos..].trim_end_matches('/').to_string(),
        None => String::new(),
    }
}

fn block_list_body(blocks: &[StagedBlock]) -> String {
    let latest: String = blocks
        .iter()
        .map(|b| format!("<Latest>{}</Latest>", xml::escape(&b.block_id)))
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>{}</BlockList>",
        latest
    )
}

/// Blob entries and the continuation marker from a `List Blobs` response.
fn parse_blob_list(body: &str) -> (Vec<ObjectEntry>, Option<String>) {
    let entries = xml::elements(body, "Blob")
        .into_iter()
        .filter_map(|blob| {
            let key = extract_tag(blob, "Name")?;
            let size = extract_tag(blob, "Content-Length")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            Some(ObjectEntry { key, size })
        })
        .collect();
    let marker = extract_tag(body, "NextMarker").filter(|m| !m.is_empty());
    (entries, marker)
}

#[async_trait]
impl StorageBackend for AbsBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn max_block_size(&self) -> usize {
        MAX_BLOCK_SIZE
    }

    async fn ensure_container(&self) -> Result<(), BackendError> {
        let resp = self
            .send(Method::PUT, None, &query(&[("restype", "container")]), &[], Bytes::new())
            .await?;
        if resp.status().is_success() {
            debug!(container = %self.config.container, "ABS container created");
            return Ok(());
        }

        let status = resp.status().as_u16();
        if status == 409 && error_code(&resp) == "ContainerAlreadyExists" {
            debug!(container = %self.config.container, "ABS container already exists");
            return Ok(());
        }
        // A container-scoped SAS token cannot create containers; accept it
        // when the container is already there.
        if status == 403 && matches!(self.config.credential, AbsCredential::Sas(_)) {
            if self.container_exists().await? {
                return Ok(());
            }
        }
        Err(error_from(resp).await)
    }

    async fn container_exists(&self) -> Result<bool, BackendError> {
        let resp = self
            .send(Method::HEAD, None, &query(&[("restype", "container")]), &[], Bytes::new())
            .await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(error_from(resp).await),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BackendError> {
        let mut entries = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut params = query(&[("restype", "container"), ("comp", "list"), ("prefix", prefix)]);
            if let Some(m) = &marker {
                params.insert("marker".to_string(), m.clone());
            }
            let resp = self.send(Method::GET, None, &params, &[], Bytes::new()).await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            let body = resp.text().await.map_err(|e| BackendError::Unavailable {
                backend: NAME,
                message: format!("failed to read ABS list response: {}", e),
            })?;

            let (page, next) = parse_blob_list(&body);
            entries.extend(page);
            match next {
                Some(m) => marker = Some(m),
                None => break,
            }
        }

        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let resp = self
            .send(Method::DELETE, Some(key), &BTreeMap::new(), &[], Bytes::new())
            .await?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(error_from(resp).await);
        }
        debug!(key = %key, "ABS delete complete");
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<(), BackendError> {
        let source_url = self.url(&self.resource_path(Some(source_key)), &BTreeMap::new());
        let resp = self
            .send(
                Method::PUT,
                Some(dest_key),
                &BTreeMap::new(),
                &[("x-ms-copy-source", source_url)],
                Bytes::new(),
            )
            .await?;
        match resp.status().as_u16() {
            200..=202 => {
                let copy_status = resp
                    .headers()
                    .get("x-ms-copy-status")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("success");
                if copy_status != "success" {
                    warn!(from = %source_key, to = %dest_key, status = %copy_status, "ABS copy still in progress");
                }
                Ok(())
            }
            404 => Err(BackendError::NotFound {
                backend: NAME,
                key: source_key.to_string(),
            }),
            _ => Err(error_from(resp).await),
        }
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadSession, BackendError> {
        // Block blobs need no server-side session; uncommitted blocks expire
        // on their own.
        Ok(UploadSession {
            key: key.to_string(),
            upload_id: None,
        })
    }

    async fn put_block(
        &self,
        session: &UploadSession,
        index: usize,
        block_id: &str,
        data: Bytes,
    ) -> Result<StagedBlock, BackendError> {
        let size = data.len();
        let resp = self
            .send(
                Method::PUT,
                Some(&session.key),
                &query(&[("comp", "block"), ("blockid", block_id)]),
                &[],
                data,
            )
            .await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        Ok(StagedBlock {
            index,
            block_id: block_id.to_string(),
            size,
            receipt: None,
        })
    }

    async fn commit_blocks(
        &self,
        session: &UploadSession,
        blocks: &[StagedBlock],
    ) -> Result<u64, BackendError> {
        let body = block_list_body(blocks);
        let resp = self
            .send(
                Method::PUT,
                Some(&session.key),
                &query(&[("comp", "blocklist")]),
                &[("content-type", "application/xml".to_string())],
                Bytes::from(body),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        let head = self
            .send(Method::HEAD, Some(&session.key), &BTreeMap::new(), &[], Bytes::new())
            .await?;
        if !head.status().is_success() {
            return Err(error_from(head).await);
        }
        let size = head
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(size)
    }
}
