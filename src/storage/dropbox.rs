use super::{
    Authorized, RemoteStore, body_preview, key_matches_prefix, normalize_prefix, validate_key,
};
use crate::{
    config::{BackendKind, DropboxConfig},
    error::SyncError,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt::Write as _;
use tracing::debug;
use url::Url;

const API_ARG_HEADER: &str = "Dropbox-API-Arg";

/// Dropbox v2 HTTP API adapter (`cloudA`).
pub struct DropboxStore {
    http: reqwest::Client,
    api_url: Url,
    content_url: Url,
    root: String,
    auth: Authorized,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_summary: String,
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<ListEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    #[serde(rename = ".tag")]
    tag: String,
    path_display: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = ".tag")]
    tag: String,
}

impl DropboxStore {
    pub(crate) fn new(cfg: DropboxConfig, http: reqwest::Client, auth: Authorized) -> Self {
        let root = cfg.root_folder.trim_matches('/');
        let root = if root.is_empty() {
            String::new()
        } else {
            format!("/{root}")
        };
        Self {
            http,
            api_url: cfg.api_url,
            content_url: cfg.content_url,
            root,
            auth,
        }
    }

    fn remote_path(&self, key: &str) -> String {
        format!("{}/{key}", self.root)
    }

    /// Key relative to the root folder, or `None` for paths outside it.
    fn key_of(&self, path_display: &str) -> Option<String> {
        let rest = if self.root.is_empty() {
            path_display
        } else {
            let head = path_display.get(..self.root.len())?;
            if !head.eq_ignore_ascii_case(&self.root) {
                return None;
            }
            &path_display[self.root.len()..]
        };
        let key = rest.trim_start_matches('/');
        (!key.is_empty()).then(|| key.to_string())
    }

    fn endpoint(base: &Url, path: &str) -> Result<Url, SyncError> {
        base.join(path)
            .map_err(|e| SyncError::Config(format!("invalid Dropbox endpoint {path}: {e}")))
    }

    async fn rpc(&self, token: &str, path: &str, body: &Value) -> Result<reqwest::Response, SyncError> {
        let url = Self::endpoint(&self.api_url, path)?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        Ok(resp)
    }

    async fn list_page(
        &self,
        token: &str,
        cursor: Option<&str>,
        folder: &str,
    ) -> Result<Option<ListFolderResponse>, SyncError> {
        let resp = match cursor {
            Some(cursor) => {
                self.rpc(token, "2/files/list_folder/continue", &json!({ "cursor": cursor }))
                    .await?
            }
            None => {
                self.rpc(
                    token,
                    "2/files/list_folder",
                    &json!({ "path": folder, "recursive": true }),
                )
                .await?
            }
        };
        if resp.status().is_success() {
            return Ok(Some(resp.json().await?));
        }
        match map_error(folder, resp).await {
            SyncError::NotFound(_) => Ok(None),
            e => Err(e),
        }
    }
}

#[async_trait]
impl RemoteStore for DropboxStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Dropbox
    }

    async fn exists(&self, key: &str) -> Result<bool, SyncError> {
        validate_key(key)?;
        let path = self.remote_path(key);
        self.auth
            .call("dropbox.get_metadata", |token| {
                let path = path.clone();
                async move {
                    let resp = self
                        .rpc(&token, "2/files/get_metadata", &json!({ "path": path }))
                        .await?;
                    if resp.status().is_success() {
                        let meta: Metadata = resp.json().await?;
                        return Ok(meta.tag == "file");
                    }
                    match map_error(&path, resp).await {
                        SyncError::NotFound(_) => Ok(false),
                        e => Err(e),
                    }
                }
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<Bytes, SyncError> {
        validate_key(key)?;
        let arg = api_arg(&json!({ "path": self.remote_path(key) }));
        let url = Self::endpoint(&self.content_url, "2/files/download")?;
        self.auth
            .call("dropbox.download", |token| {
                let (arg, url) = (arg.clone(), url.clone());
                async move {
                    let resp = self
                        .http
                        .post(url)
                        .bearer_auth(&token)
                        .header(API_ARG_HEADER, arg)
                        .send()
                        .await?;
                    if !resp.status().is_success() {
                        return Err(map_error(key, resp).await);
                    }
                    let bytes = resp.bytes().await?;
                    debug!(key, size = bytes.len(), "Dropbox download");
                    Ok(bytes)
                }
            })
            .await
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), SyncError> {
        validate_key(key)?;
        let arg = api_arg(&json!({
            "path": self.remote_path(key),
            "mode": "overwrite",
            "mute": true,
        }));
        let url = Self::endpoint(&self.content_url, "2/files/upload")?;
        self.auth
            .call("dropbox.upload", |token| {
                let (arg, url, body) = (arg.clone(), url.clone(), bytes.clone());
                let size = body.len();
                async move {
                    let resp = self
                        .http
                        .post(url)
                        .bearer_auth(&token)
                        .header(API_ARG_HEADER, arg)
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .body(body)
                        .send()
                        .await?;
                    if !resp.status().is_success() {
                        return Err(map_error(key, resp).await);
                    }
                    debug!(key, size, "Dropbox upload");
                    Ok(())
                }
            })
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let prefix = normalize_prefix(prefix)?;
        // Listing a sub-folder is cheaper, but a prefix may also name a single file.
        let folder = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.remote_path(dir),
            None => self.root.clone(),
        };

        self.auth
            .call("dropbox.list_folder", |token| {
                let folder = folder.clone();
                let prefix = prefix.clone();
                async move {
                    let mut keys = Vec::new();
                    let mut cursor: Option<String> = None;
                    loop {
                        let Some(page) = self.list_page(&token, cursor.as_deref(), &folder).await?
                        else {
                            break;
                        };
                        keys.extend(
                            page.entries
                                .iter()
                                .filter(|e| e.tag == "file")
                                .filter_map(|e| e.path_display.as_deref())
                                .filter_map(|p| self.key_of(p))
                                .filter(|k| key_matches_prefix(k, &prefix)),
                        );
                        if !page.has_more {
                            break;
                        }
                        cursor = Some(page.cursor);
                    }
                    keys.sort();
                    Ok(keys)
                }
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        validate_key(key)?;
        let path = self.remote_path(key);
        self.auth
            .call("dropbox.delete", |token| {
                let path = path.clone();
                async move {
                    let resp = self
                        .rpc(&token, "2/files/delete_v2", &json!({ "path": path }))
                        .await?;
                    if resp.status().is_success() {
                        return Ok(());
                    }
                    match map_error(&path, resp).await {
                        SyncError::NotFound(_) => Ok(()),
                        e => Err(e),
                    }
                }
            })
            .await
    }
}

/// Maps a non-success Dropbox response onto the storage error taxonomy.
async fn map_error(key: &str, resp: reqwest::Response) -> SyncError {
    let status = resp.status();
    let body = body_preview(resp).await;
    let summary = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.error_summary)
        .unwrap_or_default();

    debug!(key, %status, summary, "Dropbox error response");

    match status {
        StatusCode::UNAUTHORIZED => SyncError::Auth(format!("Dropbox rejected token: {body}")),
        StatusCode::CONFLICT if summary.contains("not_found") => {
            SyncError::NotFound(key.to_string())
        }
        StatusCode::CONFLICT if summary.contains("insufficient_space") => {
            SyncError::QuotaExceeded(summary)
        }
        StatusCode::INSUFFICIENT_STORAGE => SyncError::QuotaExceeded(body),
        _ => SyncError::Network(format!("Dropbox {status}: {body}")),
    }
}

/// JSON for the `Dropbox-API-Arg` header; non-ASCII characters are escaped as HTTP headers
/// must stay ASCII.
fn api_arg(value: &Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                let _ = write!(out, "\\u{unit:04x}");
            }
        }
    }
    out
}
