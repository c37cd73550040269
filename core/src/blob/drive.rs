//! Google Drive v3 blob store
//!
//! Uses the plain REST API. Each call asks [`DriveAuth`] for a bearer token,
//! which is either a fixed token or one minted from a service-account key.

use super::auth::{DriveAuth, ServiceAccountKey};
use super::{BlobEntry, BlobPage, BlobStore};
use crate::config::RemoteConfig;
use crate::{CacheError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const MULTIPART_BOUNDARY: &str = "vocab-tts-upload-boundary";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

pub struct DriveBlobStore {
    config: RemoteConfig,
    auth: DriveAuth,
    http_client: reqwest::Client,
}

impl DriveBlobStore {
    pub fn new(config: RemoteConfig, auth: DriveAuth) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            auth,
            http_client,
        }
    }

    /// Fixed bearer token; calls start failing once it expires.
    pub fn with_access_token(config: RemoteConfig, access_token: impl Into<String>) -> Self {
        Self::new(config, DriveAuth::Static(access_token.into()))
    }

    pub fn with_service_account(config: RemoteConfig, key: ServiceAccountKey) -> Self {
        Self::new(config, DriveAuth::service_account(key))
    }

    async fn bearer(&self) -> Result<String> {
        self.auth
            .bearer(&self.http_client)
            .await
            .map_err(|e| remote_err("auth", e))
    }

    fn multipart_body(folder: &str, name: &str, bytes: &[u8]) -> Vec<u8> {
        let metadata = json!({ "name": name, "parents": [folder] }).to_string();
        let mut body = Vec::with_capacity(bytes.len() + metadata.len() + 256);
        body.extend_from_slice(
            format!(
                "--{MULTIPART_BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!("--{MULTIPART_BOUNDARY}\r\nContent-Type: audio/mpeg\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
        body
    }
}

fn remote_err(what: &str, e: impl std::fmt::Display) -> CacheError {
    warn!(target: "remote", error = %e, "Drive {} failed", what);
    CacheError::Remote(format!("{what}: {e}"))
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(remote_err(what, format!("HTTP {status}: {snippet}")))
}

#[async_trait]
impl BlobStore for DriveBlobStore {
    async fn list(&self, folder: &str, page_token: Option<String>) -> Result<BlobPage> {
        let q = format!("'{folder}' in parents and trashed=false");
        let page_size = self.config.page_size.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("q", q.as_str()),
            ("fields", "nextPageToken, files(id, name)"),
            ("pageSize", page_size.as_str()),
        ];
        if let Some(token) = page_token.as_deref() {
            query.push(("pageToken", token));
        }

        let token = self.bearer().await?;
        let response = self
            .http_client
            .get(format!("{}/files", self.config.api_base))
            .bearer_auth(&token)
            .query(&query)
            .send()
            .await
            .map_err(|e| remote_err("list", e))?;
        let list: FileList = check_status(response, "list")
            .await?
            .json()
            .await
            .map_err(|e| remote_err("list decode", e))?;

        debug!(target: "remote", files = list.files.len(), more = list.next_page_token.is_some(), "Listed page");
        Ok(BlobPage {
            entries: list
                .files
                .into_iter()
                .map(|f| BlobEntry {
                    name: f.name,
                    id: f.id,
                })
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn upload(&self, folder: &str, name: &str, bytes: Vec<u8>) -> Result<String> {
        let token = self.bearer().await?;
        let body = Self::multipart_body(folder, name, &bytes);
        let response = self
            .http_client
            .post(format!("{}/files", self.config.upload_base))
            .bearer_auth(&token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| remote_err("upload", e))?;
        let created: CreatedFile = check_status(response, "upload")
            .await?
            .json()
            .await
            .map_err(|e| remote_err("upload decode", e))?;
        Ok(created.id)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let token = self.bearer().await?;
        let response = self
            .http_client
            .get(format!("{}/files/{}", self.config.api_base, id))
            .bearer_auth(&token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| remote_err("download", e))?;
        let bytes = check_status(response, "download")
            .await?
            .bytes()
            .await
            .map_err(|e| remote_err("download body", e))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_body_layout() {
        let body = DriveBlobStore::multipart_body("folder1", "abc.mp3", b"ID3");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with(&format!("--{MULTIPART_BOUNDARY}\r\n")));
        assert!(text.contains(r#""name":"abc.mp3""#));
        assert!(text.contains(r#""parents":["folder1"]"#));
        assert!(text.contains("Content-Type: audio/mpeg\r\n\r\nID3\r\n"));
        assert!(text.ends_with(&format!("--{MULTIPART_BOUNDARY}--\r\n")));
    }

    #[test]
    fn decodes_file_list() {
        let list: FileList = serde_json::from_str(
            r#"{"nextPageToken":"tok","files":[{"id":"1","name":"a.mp3"}]}"#,
        )
        .unwrap();
        assert_eq!(list.next_page_token.as_deref(), Some("tok"));
        assert_eq!(list.files[0].name, "a.mp3");

        let last: FileList = serde_json::from_str(r#"{"files":[]}"#).unwrap();
        assert!(last.next_page_token.is_none());
    }
}
