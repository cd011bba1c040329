//! Google Drive API client: the authenticated service handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use crate::auth::Credential;
use crate::config::DriveConfig;
use crate::error::{DriveError, Result};
use crate::models::{ApiErrorResponse, FileListResponse, NewEntry, RemoteEntry};

/// Fields requested for every entry in a listing.
const LIST_FIELDS: &str = "nextPageToken, files(id, name, mimeType, parents, size)";

/// A local file about to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: String,
}

impl Upload {
    /// Resolve `directory/file_name` and check that it is a regular file.
    pub async fn open(directory: impl AsRef<Path>, file_name: &str) -> Result<Self> {
        let path = directory.as_ref().join(file_name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(DriveError::LocalFileNotFound(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DriveError::LocalFileNotFound(path))
            }
            Err(e) => return Err(e.into()),
        }

        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .to_string();

        Ok(Self {
            path,
            file_name: file_name.to_string(),
            mime_type,
        })
    }
}

/// The storage calls the facade issues.
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Create an entry, uploading `content` when given. Only `id` comes back.
    async fn create(&self, entry: NewEntry, content: Option<Upload>) -> Result<RemoteEntry>;

    /// Current parent folder ids of an entry.
    async fn get_parents(&self, file_id: &str) -> Result<Vec<String>>;

    /// Add one parent and remove others in a single update.
    async fn update_parents(
        &self,
        file_id: &str,
        add_parent: &str,
        remove_parents: &[String],
    ) -> Result<RemoteEntry>;

    /// One page of a filtered listing over the `drive` space.
    async fn list_page(&self, query: &str, page_token: Option<&str>) -> Result<FileListResponse>;
}

/// Builds a service handle from a freshly signed-in credential.
pub trait ServiceConnector: Send + Sync {
    fn connect(&self, credential: Credential) -> Arc<dyn StorageApi>;
}

/// Connects to the real Drive API.
pub struct DriveConnector {
    config: DriveConfig,
    http: Client,
}

impl DriveConnector {
    pub fn new(config: DriveConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(config.application_name.clone())
            .build()?;
        Ok(Self { config, http })
    }
}

impl ServiceConnector for DriveConnector {
    fn connect(&self, credential: Credential) -> Arc<dyn StorageApi> {
        Arc::new(DriveService::new(&self.config, credential, self.http.clone()))
    }
}

/// Authenticated handle on the Drive API for one signed-in account.
pub struct DriveService {
    credential: Credential,
    http: Client,
    api_base: String,
    upload_base: String,
}

impl DriveService {
    pub fn new(config: &DriveConfig, credential: Credential, http: Client) -> Self {
        Self {
            credential,
            http,
            api_base: config.api_base.clone(),
            upload_base: config.upload_base.clone(),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.credential.access_token().await?;
        Ok(request.bearer_auth(token))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.authorized(request).await?.send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Create a metadata-only entry (folders).
    async fn create_metadata(&self, entry: &NewEntry) -> Result<RemoteEntry> {
        let request = self
            .http
            .post(format!("{}/files", self.api_base))
            .query(&[("fields", "id")])
            .json(entry);
        self.send_json(request).await
    }

    /// Create an entry with content using multipart upload.
    async fn create_multipart(&self, entry: &NewEntry, upload: Upload) -> Result<RemoteEntry> {
        let file = tokio::fs::File::open(&upload.path).await?;
        let length = file.metadata().await?.len();

        let metadata_part = Part::text(serde_json::to_string(entry)?).mime_str("application/json")?;

        let body = Body::wrap_stream(ReaderStream::new(file));
        let file_part = Part::stream_with_length(body, length)
            .file_name(upload.file_name)
            .mime_str(&upload.mime_type)?;

        let form = Form::new()
            .part("metadata", metadata_part)
            .part("file", file_part);

        let request = self
            .http
            .post(format!("{}/files", self.upload_base))
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .multipart(form);
        self.send_json(request).await
    }
}

#[async_trait]
impl StorageApi for DriveService {
    #[instrument(skip(self, entry, content), fields(name = %entry.name))]
    async fn create(&self, entry: NewEntry, content: Option<Upload>) -> Result<RemoteEntry> {
        match content {
            Some(upload) => self.create_multipart(&entry, upload).await,
            None => self.create_metadata(&entry).await,
        }
    }

    #[instrument(skip(self))]
    async fn get_parents(&self, file_id: &str) -> Result<Vec<String>> {
        let request = self
            .http
            .get(format!("{}/files/{}", self.api_base, file_id))
            .query(&[("fields", "parents")]);
        let entry: RemoteEntry = self.send_json(request).await?;
        Ok(entry.parents)
    }

    #[instrument(skip(self))]
    async fn update_parents(
        &self,
        file_id: &str,
        add_parent: &str,
        remove_parents: &[String],
    ) -> Result<RemoteEntry> {
        let mut request = self
            .http
            .patch(format!("{}/files/{}", self.api_base, file_id))
            .query(&[("addParents", add_parent), ("fields", "id, parents")]);

        if !remove_parents.is_empty() {
            request = request.query(&[("removeParents", remove_parents.join(","))]);
        }

        self.send_json(request.json(&serde_json::json!({}))).await
    }

    #[instrument(skip(self))]
    async fn list_page(&self, query: &str, page_token: Option<&str>) -> Result<FileListResponse> {
        let mut request = self
            .http
            .get(format!("{}/files", self.api_base))
            .query(&[("q", query), ("spaces", "drive"), ("fields", LIST_FIELDS)]);

        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let page: FileListResponse = self.send_json(request).await?;
        debug!(
            count = page.files.len(),
            has_more = page.next_page_token.is_some(),
            "Fetched listing page"
        );
        Ok(page)
    }
}

/// Map a non-success response to `DriveError::ApiError`, preferring the
/// Google error body when it parses.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_body = response.text().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&error_body) {
        return Err(DriveError::ApiError {
            status: api_error.error.code,
            message: api_error.error.message,
        });
    }
    Err(DriveError::ApiError {
        status: status.as_u16(),
        message: error_body,
    })
}
