use super::{
    Authorized, RemoteStore, body_preview, key_matches_prefix, normalize_prefix, validate_key,
};
use crate::{
    config::{BackendKind, DriveConfig},
    error::SyncError,
};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::{StatusCode, header::CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

const MULTIPART_BOUNDARY: &str = "intentsync-part-boundary";
const PAGE_SIZE: &str = "1000";

/// Google Drive v3 adapter (`cloudB`).
///
/// Every key is one file directly inside the configured folder, named by the full key.
pub struct DriveStore {
    http: reqwest::Client,
    api_url: Url,
    upload_url: Url,
    folder_id: String,
    auth: Authorized,
}

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

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ErrorReason {
    #[serde(default)]
    reason: String,
}

impl DriveStore {
    pub(crate) fn new(cfg: DriveConfig, http: reqwest::Client, auth: Authorized) -> Self {
        Self {
            http,
            api_url: cfg.api_url,
            upload_url: cfg.upload_url,
            folder_id: cfg.folder_id,
            auth,
        }
    }

    fn url(base: &Url, path: &str) -> Result<Url, SyncError> {
        base.join(path)
            .map_err(|e| SyncError::Config(format!("invalid Drive endpoint {path}: {e}")))
    }

    async fn list_files(
        &self,
        token: &str,
        query: &str,
        limit_one: bool,
    ) -> Result<Vec<DriveFile>, SyncError> {
        let url = Self::url(&self.api_url, "drive/v3/files")?;
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self.http.get(url.clone()).bearer_auth(token).query(&[
                ("q", query),
                ("fields", "nextPageToken,files(id,name)"),
                ("orderBy", "modifiedTime desc"),
                ("spaces", "drive"),
                ("pageSize", if limit_one { "1" } else { PAGE_SIZE }),
            ]);
            if let Some(page) = page_token.as_deref() {
                req = req.query(&[("pageToken", page)]);
            }
            let resp = req.send().await?;
            if !resp.status().is_success() {
                return Err(map_error(query, resp).await);
            }
            let page: FileList = resp.json().await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(next) if !limit_one => page_token = Some(next),
                _ => break,
            }
        }
        Ok(files)
    }

    async fn find(&self, token: &str, key: &str) -> Result<Option<String>, SyncError> {
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(key),
            escape_query(&self.folder_id)
        );
        let files = self.list_files(token, &query, true).await?;
        Ok(files.into_iter().next().map(|f| f.id))
    }

    fn multipart_body(&self, key: &str, bytes: &Bytes) -> Bytes {
        let meta = json!({ "name": key, "parents": [self.folder_id] });
        let mut body = BytesMut::with_capacity(bytes.len() + 512);
        body.put_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        body.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.put_slice(meta.to_string().as_bytes());
        body.put_slice(format!("\r\n--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        body.put_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.put_slice(bytes);
        body.put_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
        body.freeze()
    }
}

#[async_trait]
impl RemoteStore for DriveStore {
    fn kind(&self) -> BackendKind {
        BackendKind::GoogleDrive
    }

    async fn exists(&self, key: &str) -> Result<bool, SyncError> {
        validate_key(key)?;
        self.auth
            .call("drive.find", |token| async move {
                Ok(self.find(&token, key).await?.is_some())
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<Bytes, SyncError> {
        validate_key(key)?;
        self.auth
            .call("drive.download", |token| async move {
                let id = self
                    .find(&token, key)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(key.to_string()))?;
                let url = Self::url(&self.api_url, &format!("drive/v3/files/{id}"))?;
                let resp = self
                    .http
                    .get(url)
                    .bearer_auth(&token)
                    .query(&[("alt", "media")])
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(map_error(key, resp).await);
                }
                let bytes = resp.bytes().await?;
                debug!(key, size = bytes.len(), "Drive download");
                Ok(bytes)
            })
            .await
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), SyncError> {
        validate_key(key)?;
        self.auth
            .call("drive.upload", |token| {
                let bytes = bytes.clone();
                async move {
                    let resp = match self.find(&token, key).await? {
                        Some(id) => {
                            let url =
                                Self::url(&self.upload_url, &format!("upload/drive/v3/files/{id}"))?;
                            self.http
                                .patch(url)
                                .bearer_auth(&token)
                                .query(&[("uploadType", "media")])
                                .header(CONTENT_TYPE, "application/octet-stream")
                                .body(bytes.clone())
                                .send()
                                .await?
                        }
                        None => {
                            let url = Self::url(&self.upload_url, "upload/drive/v3/files")?;
                            self.http
                                .post(url)
                                .bearer_auth(&token)
                                .query(&[("uploadType", "multipart")])
                                .header(
                                    CONTENT_TYPE,
                                    format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
                                )
                                .body(self.multipart_body(key, &bytes))
                                .send()
                                .await?
                        }
                    };
                    if !resp.status().is_success() {
                        return Err(map_error(key, resp).await);
                    }
                    debug!(key, size = bytes.len(), "Drive upload");
                    Ok(())
                }
            })
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let prefix = normalize_prefix(prefix)?;
        let query = format!(
            "'{}' in parents and trashed = false",
            escape_query(&self.folder_id)
        );
        self.auth
            .call("drive.list", |token| {
                let (query, prefix) = (query.clone(), prefix.clone());
                async move {
                    let mut keys: Vec<String> = self
                        .list_files(&token, &query, false)
                        .await?
                        .into_iter()
                        .map(|f| f.name)
                        .filter(|name| key_matches_prefix(name, &prefix))
                        .collect();
                    keys.sort();
                    keys.dedup();
                    Ok(keys)
                }
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        validate_key(key)?;
        self.auth
            .call("drive.delete", |token| async move {
                let Some(id) = self.find(&token, key).await? else {
                    return Ok(());
                };
                let url = Self::url(&self.api_url, &format!("drive/v3/files/{id}"))?;
                let resp = self.http.delete(url).bearer_auth(&token).send().await?;
                if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
                    return Ok(());
                }
                Err(map_error(key, resp).await)
            })
            .await
    }
}

/// Maps a non-success Drive response onto the storage error taxonomy.
async fn map_error(key: &str, resp: reqwest::Response) -> SyncError {
    let status = resp.status();
    let body = body_preview(resp).await;
    let detail = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|e| e.error)
        .unwrap_or_default();
    let has_reason = |wanted: &[&str]| {
        detail
            .errors
            .iter()
            .any(|r| wanted.contains(&r.reason.as_str()))
    };

    debug!(key, %status, message = %detail.message, "Drive error response");

    match status {
        StatusCode::UNAUTHORIZED => SyncError::Auth(format!("Drive rejected token: {body}")),
        StatusCode::NOT_FOUND => SyncError::NotFound(key.to_string()),
        StatusCode::FORBIDDEN if has_reason(&["storageQuotaExceeded", "quotaExceeded"]) => {
            SyncError::QuotaExceeded(detail.message)
        }
        _ => SyncError::Network(format!("Drive {status}: {body}")),
    }
}

fn escape_query(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_are_escaped() {
        assert_eq!(escape_query("it's"), "it\\'s");
        assert_eq!(escape_query("a\\b"), "a\\\\b");
    }
}
