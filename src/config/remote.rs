use serde::{Deserialize, Serialize};
use url::Url;

/// Dropbox HTTP API endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DropboxConfig {
    /// RPC endpoint base. TOML: `dropbox.api_url`. Default: `https://api.dropboxapi.com/`.
    #[serde(default = "default_dropbox_api_url")]
    pub api_url: Url,

    /// Content endpoint base. TOML: `dropbox.content_url`. Default: `https://content.dropboxapi.com/`.
    #[serde(default = "default_dropbox_content_url")]
    pub content_url: Url,

    /// Folder all keys are stored under, e.g. `/backdoor`. Default: app root.
    #[serde(default)]
    pub root_folder: String,
}

impl Default for DropboxConfig {
    fn default() -> Self {
        Self {
            api_url: default_dropbox_api_url(),
            content_url: default_dropbox_content_url(),
            root_folder: String::new(),
        }
    }
}

/// Google Drive v3 endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DriveConfig {
    /// TOML: `google_drive.api_url`. Default: `https://www.googleapis.com/`.
    #[serde(default = "default_drive_api_url")]
    pub api_url: Url,

    /// TOML: `google_drive.upload_url`. Default: `https://www.googleapis.com/`.
    #[serde(default = "default_drive_api_url")]
    pub upload_url: Url,

    /// Parent folder id holding every key. Default: `root`.
    #[serde(default = "default_drive_folder")]
    pub folder_id: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_url: default_drive_api_url(),
            upload_url: default_drive_api_url(),
            folder_id: default_drive_folder(),
        }
    }
}

pub(crate) const DROPBOX_AUTH_URL: &str = "https://www.dropbox.com/oauth2/authorize";
pub(crate) const DROPBOX_TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
pub(crate) const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub(crate) const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

fn default_dropbox_api_url() -> Url {
    Url::parse("https://api.dropboxapi.com/").expect("valid Dropbox API URL")
}

fn default_dropbox_content_url() -> Url {
    Url::parse("https://content.dropboxapi.com/").expect("valid Dropbox content URL")
}

fn default_drive_api_url() -> Url {
    Url::parse("https://www.googleapis.com/").expect("valid Google APIs URL")
}

fn default_drive_folder() -> String {
    "root".to_string()
}
