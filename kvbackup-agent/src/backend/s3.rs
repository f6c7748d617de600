//! S3-compatible backend.
//!
//! Uses path-style requests signed with AWS Signature V4 over reqwest, so
//! no SDK dependency is needed. Blocks map onto multipart upload parts;
//! the commit is `CompleteMultipartUpload` with parts in stream order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use kvbackup_common::backend::{BackendError, ObjectEntry, StagedBlock, StorageBackend, UploadSession};
use reqwest::{Client, Method, Response};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::encode_key;
use super::xml::{self, extract_tag};

type HmacSha256 = Hmac<Sha256>;

const NAME: &str = "s3";
/// Largest part S3 accepts.
const MAX_PART_SIZE: usize = 5 * 1024 * 1024 * 1024;
/// Smallest part S3 accepts, except for the last one.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>, // Custom endpoint for MinIO or other S3-compatible APIs
    pub access_key_id: String,
    pub secret_access_key: String,
}

pub struct S3Backend {
    config: S3Config,
    client: Client,
}

impl S3Backend {
    pub fn new(config: S3Config, client: Client) -> Self {
        Self { config, client }
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(ep) => ep.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.config.region),
        }
    }

    /// Canonical URI for the bucket or for an object in it.
    fn canonical_uri(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("/{}/{}", self.config.bucket, encode_key(key)),
            None => format!("/{}", self.config.bucket),
        }
    }

    /// Compute AWS Signature V4 for a request.
    fn sign(
        &self,
        method: &str,
        canonical_uri: &str,
        query: &str,
        headers: &BTreeMap<String, String>,
        body_hash: &str,
        date_time: &str,
        date: &str,
    ) -> String {
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let signed_headers: String = headers.keys().cloned().collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, query, canonical_headers, signed_headers, body_hash
        );

        let cr_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let credential_scope = format!("{}/{}/s3/aws4_request", date, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            date_time, credential_scope, cr_hash
        );

        let signing_key = derive_signing_key(
            &self.config.secret_access_key,
            date,
            &self.config.region,
        );

        let mut mac = HmacSha256::new_from_slice(&signing_key).expect("HMAC key length ok");
        mac.update(string_to_sign.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            self.config.access_key_id, credential_scope, signed_headers, signature
        )
    }

    /// Sign and send one request. Transport failures become `Unavailable`;
    /// the caller interprets the status.
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &BTreeMap<String, String>,
        extra_headers: &[(&str, String)],
        body: Bytes,
    ) -> Result<Response, BackendError> {
        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let endpoint = self.endpoint();
        let canonical_uri = self.canonical_uri(key);
        let canonical_query = canonical_query(query);
        let body_hash_str = body_hash(&body);

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), url_host(&endpoint));
        headers.insert("x-amz-content-sha256".to_string(), body_hash_str.clone());
        headers.insert("x-amz-date".to_string(), date_time.clone());
        for (name, value) in extra_headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }

        let auth = self.sign(
            method.as_str(),
            &canonical_uri,
            &canonical_query,
            &headers,
            &body_hash_str,
            &date_time,
            &date,
        );

        let mut url = format!("{}{}", endpoint, canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &auth);
        for (name, value) in &headers {
            if name != "host" {
                req = req.header(name.as_str(), value.as_str());
            }
        }

        req.body(body).send().await.map_err(|e| BackendError::Unavailable {
            backend: NAME,
            message: format!("S3 {} request failed: {}", method, e),
        })
    }
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length ok");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn body_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn error_from(resp: Response) -> BackendError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    BackendError::from_status(NAME, status, body)
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn max_block_size(&self) -> usize {
        MAX_PART_SIZE
    }

    async fn ensure_container(&self) -> Result<(), BackendError> {
        let body = if self.config.region == "us-east-1" {
            Bytes::new()
        } else {
            Bytes::from(format!(
                "<CreateBucketConfiguration><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.config.region
            ))
        };
        let resp = self.send(Method::PUT, None, &BTreeMap::new(), &[], body).await?;

        if resp.status().is_success() {
            debug!(bucket = %self.config.bucket, "S3 bucket created");
            return Ok(());
        }
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if status == 409 && text.contains("BucketAlreadyOwnedByYou") {
            debug!(bucket = %self.config.bucket, "S3 bucket already exists");
            return Ok(());
        }
        Err(BackendError::from_status(NAME, status, text))
    }

    async fn container_exists(&self) -> Result<bool, BackendError> {
        let resp = self.send(Method::HEAD, None, &BTreeMap::new(), &[], Bytes::new()).await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(error_from(resp).await),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BackendError> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut params = query(&[("list-type", "2"), ("prefix", prefix)]);
            if let Some(token) = &continuation {
                params.insert("continuation-token".to_string(), token.clone());
            }
            let resp = self.send(Method::GET, None, &params, &[], Bytes::new()).await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            let body = resp.text().await.map_err(|e| BackendError::Unavailable {
                backend: NAME,
                message: format!("failed to read S3 list response: {}", e),
            })?;

            let page = parse_list_page(&body);
            entries.extend(page.entries);
            match page.next_token {
                Some(token) if page.truncated => continuation = Some(token),
                _ => break,
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
        debug!(key = %key, "S3 delete complete");
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<(), BackendError> {
        let source = format!("/{}/{}", self.config.bucket, encode_key(source_key));
        let resp = self
            .send(
                Method::PUT,
                Some(dest_key),
                &BTreeMap::new(),
                &[("x-amz-copy-source", source)],
                Bytes::new(),
            )
            .await?;
        match resp.status().as_u16() {
            200 => Ok(()),
            404 => Err(BackendError::NotFound {
                backend: NAME,
                key: source_key.to_string(),
            }),
            _ => Err(error_from(resp).await),
        }
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadSession, BackendError> {
        let resp = self
            .send(Method::POST, Some(key), &query(&[("uploads", "")]), &[], Bytes::new())
            .await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        let body = resp.text().await.unwrap_or_default();
        let upload_id = extract_tag(&body, "UploadId").ok_or_else(|| BackendError::Rejected {
            backend: NAME,
            status: 200,
            message: "CreateMultipartUpload response has no UploadId".to_string(),
        })?;
        Ok(UploadSession {
            key: key.to_string(),
            upload_id: Some(upload_id),
        })
    }

    async fn put_block(
        &self,
        session: &UploadSession,
        index: usize,
        block_id: &str,
        data: Bytes,
    ) -> Result<StagedBlock, BackendError> {
        let upload_id = session.upload_id.clone().unwrap_or_default();
        let part_number = (index + 1).to_string();
        let size = data.len();
        let resp = self
            .send(
                Method::PUT,
                Some(&session.key),
                &query(&[("partNumber", part_number.as_str()), ("uploadId", upload_id.as_str())]),
                &[],
                data,
            )
            .await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        let etag = resp
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Ok(StagedBlock {
            index,
            block_id: block_id.to_string(),
            size,
            receipt: etag,
        })
    }

    async fn commit_blocks(
        &self,
        session: &UploadSession,
        blocks: &[StagedBlock],
    ) -> Result<u64, BackendError> {
        let upload_id = session.upload_id.clone().unwrap_or_default();

        if blocks.is_empty() {
            // S3 refuses to complete a multipart upload with no parts; drop
            // the session and write an empty object instead.
            let abort = self
                .send(
                    Method::DELETE,
                    Some(&session.key),
                    &query(&[("uploadId", upload_id.as_str())]),
                    &[],
                    Bytes::new(),
                )
                .await;
            if let Err(e) = abort {
                warn!(key = %session.key, error = %e, "Failed to abort empty multipart upload");
            }
            let resp = self
                .send(Method::PUT, Some(&session.key), &BTreeMap::new(), &[], Bytes::new())
                .await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            return Ok(0);
        }

        let body = complete_multipart_body(blocks);
        let resp = self
            .send(
                Method::POST,
                Some(&session.key),
                &query(&[("uploadId", upload_id.as_str())]),
                &[("content-type", "application/xml".to_string())],
                Bytes::from(body),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        // CompleteMultipartUpload can report failure inside a 200 response.
        let text = resp.text().await.unwrap_or_default();
        if text.contains("<Error>") {
            let code = extract_tag(&text, "Code").unwrap_or_default();
            let retryable = matches!(code.as_str(), "InternalError" | "SlowDown");
            return Err(if retryable {
                BackendError::Unavailable {
                    backend: NAME,
                    message: text,
                }
            } else {
                BackendError::Rejected {
                    backend: NAME,
                    status: 200,
                    message: text,
                }
            });
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

fn complete_multipart_body(blocks: &[StagedBlock]) -> String {
    let parts: String = blocks
        .iter()
        .map(|b| {
            format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                b.index + 1,
                b.receipt.as_deref().unwrap_or_default()
            )
        })
        .collect();
    format!("<CompleteMultipartUpload>{}</CompleteMultipartUpload>", parts)
}

struct ListPage {
    entries: Vec<ObjectEntry>,
    truncated: bool,
    next_token: Option<String>,
}

/// Extract `<Contents>` entries and pagination state from a ListObjectsV2
/// XML response.
fn parse_list_page(xml: &str) -> ListPage {
    let entries = xml::elements(xml, "Contents")
        .into_iter()
        .filter_map(|contents| {
            let key = extract_tag(contents, "Key")?;
            let size = extract_tag(contents, "Size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            Some(ObjectEntry { key, size })
        })
        .collect();

    ListPage {
        entries,
        truncated: extract_tag(xml, "IsTruncated").as_deref() == Some("true"),
        next_token: extract_tag(xml, "NextContinuationToken"),
    }
}

/// Extract the host part from a URL for use in signing.
fn url_host(url: &str) -> String {
    // Strip scheme and path, return just host[:port]
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{prelude::HttpMockRequest, MockServer};

    fn backend() -> S3Backend {
        S3Backend::new(
            S3Config {
                bucket: "etcd-backups".to_string(),
                region: "us-east-1".to_string(),
                endpoint: None,
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            },
            Client::new(),
        )
    }

    #[test]
    fn test_parse_list_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>v1/prod/20260101T000000.000000Z</Key><Size>1024</Size></Contents>
  <Contents><Key>v1/prod/a&amp;b</Key><Size>7</Size></Contents>
  <NextContinuationToken>token-2</NextContinuationToken>
</ListBucketResult>"#;
        let page = parse_list_page(xml);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].key, "v1/prod/20260101T000000.000000Z");
        assert_eq!(page.entries[0].size, 1024);
        assert_eq!(page.entries[1].key, "v1/prod/a&b");
        assert!(page.truncated);
        assert_eq!(page.next_token.as_deref(), Some("token-2"));
    }

    #[test]
    fn test_complete_multipart_body_orders_parts() {
        let blocks: Vec<StagedBlock> = (0..3)
            .map(|i| StagedBlock {
                index: i,
                block_id: format!("b{}", i),
                size: 1,
                receipt: Some(format!("\"etag{}\"", i)),
            })
            .collect();
        let body = complete_multipart_body(&blocks);
        let first = body.find("<PartNumber>1</PartNumber><ETag>\"etag0\"</ETag>").unwrap();
        let third = body.find("<PartNumber>3</PartNumber><ETag>\"etag2\"</ETag>").unwrap();
        assert!(first < third);
    }

    #[test]
    fn test_canonical_uri_and_query() {
        let b = backend();
        assert_eq!(b.canonical_uri(None), "/etcd-backups");
        assert_eq!(
            b.canonical_uri(Some("v1/my prefix/20260101T000000.000000Z")),
            "/etcd-backups/v1/my%20prefix/20260101T000000.000000Z"
        );
        let q = query(&[("prefix", "v1/prod/"), ("list-type", "2")]);
        assert_eq!(canonical_query(&q), "list-type=2&prefix=v1%2Fprod%2F");
        assert_eq!(canonical_query(&query(&[("uploads", "")])), "uploads=");
    }

    #[test]
    fn test_signature_is_deterministic() {
        let b = backend();
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "s3.us-east-1.amazonaws.com".to_string());
        let sign = || b.sign("GET", "/etcd-backups", "", &headers, &body_hash(b""), "20260101T000000Z", "20260101");
        let auth = sign();
        assert_eq!(auth, sign());
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260101/us-east-1/s3/aws4_request,SignedHeaders=host,Signature="
        ));
    }

    #[test]
    fn test_url_host() {
        assert_eq!(url_host("https://s3.us-east-1.amazonaws.com"), "s3.us-east-1.amazonaws.com");
        assert_eq!(url_host("http://localhost:9000"), "localhost:9000");
    }

    #[test]
    fn test_hmac_sha256() {
        let result = hmac_sha256(b"secret", b"data");
        assert_eq!(result.len(), 32);
    }

    fn mock_backend(server: &MockServer) -> S3Backend {
        S3Backend::new(
            S3Config {
                bucket: "etcd-backups".to_string(),
                region: "us-east-1".to_string(),
                endpoint: Some(server.base_url()),
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
            },
            Client::new(),
        )
    }

    fn without_continuation(req: &HttpMockRequest) -> bool {
        !req.query_params
            .iter()
            .flatten()
            .any(|(k, _)| k == "continuation-token")
    }

    fn session(key: &str) -> UploadSession {
        UploadSession {
            key: key.to_string(),
            upload_id: Some("upload-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_ensure_bucket_already_owned() {
        let server = MockServer::start();
        let create = server.mock(|when, then| {
            when.method("PUT")
                .path("/etcd-backups")
                .header_exists("x-amz-date")
                .header_exists("authorization");
            then.status(409)
                .body("<Error><Code>BucketAlreadyOwnedByYou</Code></Error>");
        });

        mock_backend(&server).ensure_container().await.unwrap();
        create.assert();
    }

    #[tokio::test]
    async fn test_ensure_bucket_owned_elsewhere_fails() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("PUT").path("/etcd-backups");
            then.status(409)
                .body("<Error><Code>BucketAlreadyExists</Code></Error>");
        });

        let err = mock_backend(&server).ensure_container().await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_list_follows_continuation_token() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method("GET")
                .path("/etcd-backups")
                .query_param("list-type", "2")
                .query_param("prefix", "v1/prod/")
                .matches(without_continuation);
            then.status(200).body(
                "<ListBucketResult><IsTruncated>true</IsTruncated>\
<Contents><Key>v1/prod/a</Key><Size>3</Size></Contents>\
<NextContinuationToken>token-2</NextContinuationToken></ListBucketResult>",
            );
        });
        let second = server.mock(|when, then| {
            when.method("GET")
                .path("/etcd-backups")
                .query_param("continuation-token", "token-2");
            then.status(200).body(
                "<ListBucketResult><IsTruncated>false</IsTruncated>\
<Contents><Key>v1/prod/b</Key><Size>5</Size></Contents></ListBucketResult>",
            );
        });

        let listed = mock_backend(&server).list_objects("v1/prod/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["v1/prod/a", "v1/prod/b"]);
        assert_eq!(listed[1].size, 5);
        first.assert_hits(1);
        second.assert_hits(1);
    }

    #[tokio::test]
    async fn test_empty_upload_aborts_and_writes_empty_object() {
        let server = MockServer::start();
        let initiate = server.mock(|when, then| {
            when.method("POST")
                .path("/etcd-backups/v1/prod/empty")
                .query_param_exists("uploads");
            then.status(200).body(
                "<InitiateMultipartUploadResult><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>",
            );
        });
        let abort = server.mock(|when, then| {
            when.method("DELETE")
                .path("/etcd-backups/v1/prod/empty")
                .query_param("uploadId", "upload-1");
            then.status(204);
        });
        let put = server.mock(|when, then| {
            when.method("PUT").path("/etcd-backups/v1/prod/empty");
            then.status(200);
        });

        let backend = mock_backend(&server);
        let summary = crate::upload::upload_stream(
            &backend,
            "v1/prod/empty",
            &mut tokio::io::empty(),
            MIN_PART_SIZE,
        )
        .await
        .unwrap();

        assert!(summary.blocks.is_empty());
        assert_eq!(summary.committed_size, 0);
        initiate.assert();
        abort.assert();
        put.assert();
    }

    #[tokio::test]
    async fn test_error_inside_complete_response() {
        let server = MockServer::start();
        let complete = server.mock(|when, then| {
            when.method("POST")
                .path("/etcd-backups/v1/prod/x")
                .query_param("uploadId", "upload-1");
            then.status(200).body(
                "<Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>",
            );
        });
        let head = server.mock(|when, then| {
            when.method("HEAD").path("/etcd-backups/v1/prod/x");
            then.status(200).header("content-length", "4");
        });
        let block = StagedBlock {
            index: 0,
            block_id: "b0".to_string(),
            size: 4,
            receipt: Some("\"etag-0\"".to_string()),
        };

        let err = mock_backend(&server)
            .commit_blocks(&session("v1/prod/x"), &[block])
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        complete.assert();
        head.assert_hits(0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_inside_complete_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/etcd-backups/v1/prod/x");
            then.status(200)
                .body("<Error><Code>InvalidPart</Code></Error>");
        });
        let block = StagedBlock {
            index: 0,
            block_id: "b0".to_string(),
            size: 4,
            receipt: None,
        };

        let err = mock_backend(&server)
            .commit_blocks(&session("v1/prod/x"), &[block])
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Rejected { status: 200, .. }));
    }
}
