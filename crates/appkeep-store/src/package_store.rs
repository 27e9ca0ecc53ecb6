use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::io::AsyncReadExt;

use crate::StoreError;

const READ_CHUNK_BYTES: usize = 64 * 1024;

pub type ByteStream = BoxStream<'static, Result<Bytes, StoreError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    pub size: Option<u64>,
    pub content_type: Option<String>,
}

/// Key/value blob store holding package payloads.
#[async_trait]
pub trait PackageStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn get(&self, key: &str) -> Result<ByteStream, StoreError>;
    async fn head_metadata(&self, key: &str) -> Result<PackageMetadata, StoreError>;
}

/// Opens a store from a location string: `http(s)://` base URLs map to
/// [`HttpPackageStore`], anything else is treated as a directory root.
pub fn open_package_store(location: &str) -> Result<Arc<dyn PackageStore>, StoreError> {
    let trimmed = location.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(Arc::new(HttpPackageStore::new(trimmed)?));
    }
    Ok(Arc::new(FsPackageStore::new(trimmed)))
}

#[derive(Debug, Clone)]
pub struct FsPackageStore {
    root: PathBuf,
}

impl FsPackageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key.trim_start_matches('/'));
        if key.trim().is_empty()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl PackageStore for FsPackageStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::io("failed to inspect package", path, err)),
        }
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StoreError> {
        let path = self.resolve(key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(err) => return Err(StoreError::io("failed to open package", path, err)),
        };

        let chunks = stream::try_unfold((file, path), |(mut file, path)| async move {
            let mut buffer = vec![0_u8; READ_CHUNK_BYTES];
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|err| StoreError::io("failed to read package", path.clone(), err))?;
            if read == 0 {
                return Ok(None);
            }
            buffer.truncate(read);
            Ok::<_, StoreError>(Some((Bytes::from(buffer), (file, path))))
        });
        Ok(chunks.boxed())
    }

    async fn head_metadata(&self, key: &str) -> Result<PackageMetadata, StoreError> {
        let path = self.resolve(key)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(err) => return Err(StoreError::io("failed to inspect package", path, err)),
        };
        Ok(PackageMetadata {
            size: Some(metadata.len()),
            content_type: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpPackageStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPackageStore {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("appkeep/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl PackageStore for HttpPackageStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let response = self.client.head(self.object_url(key)).send().await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StoreError> {
        let response = self.client.get(self.object_url(key)).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes_stream().map_err(StoreError::from).boxed())
    }

    async fn head_metadata(&self, key: &str) -> Result<PackageMetadata, StoreError> {
        let response = self.client.head(self.object_url(key)).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            });
        }

        let headers = response.headers();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned);
        Ok(PackageMetadata { size, content_type })
    }
}
