//! WebDAV file store (Nextcloud-style `remote.php/dav/files/<user>` layout)

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Method, StatusCode};

use super::file_store::{FileStore, RetrievalError};
use crate::config::FileStoreConfig;
use crate::types::FileRef;

/// File store client speaking WebDAV with basic auth
pub struct WebDavFileStore {
    client: Client,
    /// `<base>/remote.php/dav/files/<user>`
    dav_root: String,
    user: String,
    password: String,
}

impl WebDavFileStore {
    /// Create a new WebDAV client
    pub fn new(config: &FileStoreConfig) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RetrievalError::Transport(format!("failed to build HTTP client: {}", e)))?;

        let dav_root = format!(
            "{}/remote.php/dav/files/{}",
            config.url.trim_end_matches('/'),
            urlencoding::encode(&config.user)
        );

        Ok(Self {
            client,
            dav_root,
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// Translate a file-store path into a path relative to the user's DAV root
    ///
    /// Event paths look like `/<user>/files/<relative>`; the user and `files`
    /// segments are stripped when present.
    pub fn dav_path(&self, path: &str) -> String {
        let trimmed = path.trim_start_matches('/');
        let without_user = trimmed
            .strip_prefix(self.user.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(trimmed);
        let relative = without_user
            .strip_prefix("files/")
            .unwrap_or(without_user);
        relative.trim_start_matches('/').to_string()
    }

    /// Full URL of a file, with each path segment percent-encoded
    pub fn file_url(&self, path: &str) -> String {
        let encoded: Vec<String> = self
            .dav_path(path)
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.dav_root, encoded.join("/"))
    }
}

#[async_trait]
impl FileStore for WebDavFileStore {
    async fn fetch(&self, file: &FileRef, max_size: u64) -> Result<Vec<u8>, RetrievalError> {
        if file.size > max_size {
            return Err(RetrievalError::TooLarge {
                size: file.size,
                limit: max_size,
            });
        }

        let url = self.file_url(&file.path);
        tracing::debug!("Fetching file {} from {}", file.id, url);

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| RetrievalError::Transport(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RetrievalError::NotFound(file.path.clone()));
        }
        if !status.is_success() {
            return Err(RetrievalError::Transport(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        if let Some(length) = response.content_length() {
            if length > max_size {
                return Err(RetrievalError::TooLarge {
                    size: length,
                    limit: max_size,
                });
            }
        }

        let mut content = Vec::with_capacity(file.size.min(max_size) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| RetrievalError::Transport(format!("reading {} failed: {}", url, e)))?;
            let received = content.len() as u64 + chunk.len() as u64;
            if received > max_size {
                return Err(RetrievalError::TooLarge {
                    size: received,
                    limit: max_size,
                });
            }
            content.extend_from_slice(&chunk);
        }

        tracing::debug!("Fetched {} bytes for file {}", content.len(), file.id);
        Ok(content)
    }

    async fn health_check(&self) -> Result<(), RetrievalError> {
        let propfind = Method::from_bytes(b"PROPFIND")
            .map_err(|e| RetrievalError::Transport(e.to_string()))?;

        let response = self
            .client
            .request(propfind, format!("{}/", self.dav_root))
            .basic_auth(&self.user, Some(&self.password))
            .header("Depth", "0")
            .send()
            .await
            .map_err(|e| RetrievalError::Transport(format!("health check failed: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RetrievalError::Transport(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    fn name(&self) -> &str {
        "webdav"
    }
}
