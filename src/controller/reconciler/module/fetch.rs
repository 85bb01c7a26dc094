//! # Source Fetching
//!
//! Materializes a module source into its fetch workspace.
//!
//! - `git`: `git clone [--branch <version>] <url> <workspace>`
//! - `http`: download to a temp file, then by extension of the URL path:
//!   `.zip` is extracted with `unzip` (a single top-level directory becomes the module root);
//!   `.gz`/`.tgz` is decompressed as one stream into `main.tf` (not a tar unpack);
//!   anything else is an unsupported archive type
//! - `local` and unknown types succeed with an empty workspace

use crate::crd::{ModuleSource, SourceKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// File name the gzip stream is decompressed into
pub const GZIP_OUTPUT_FILE: &str = "main.tf";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("workspace {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git clone of {url} failed: {output}")]
    Git { url: String, output: String },
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to download file: {status}")]
    HttpStatus { status: String },
    #[error("unsupported archive type: {0}")]
    UnsupportedArchive(String),
    #[error("failed to extract archive: {0}")]
    Extract(String),
    #[error("path {0} does not exist in the fetched source")]
    MissingPath(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `source` into `workspace` (recreated empty) and return the module root
    async fn fetch(&self, source: &ModuleSource, workspace: &Path) -> Result<PathBuf, FetchError>;
}

#[derive(Debug, Clone)]
pub struct CommandFetcher {
    git_bin: String,
    unzip_bin: String,
    http: reqwest::Client,
}

impl CommandFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("astrolabe-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            git_bin: "git".to_string(),
            unzip_bin: "unzip".to_string(),
            http,
        })
    }

    async fn clone_git(&self, source: &ModuleSource, workspace: &Path) -> Result<(), FetchError> {
        let mut cmd = Command::new(&self.git_bin);
        cmd.arg("clone");
        if let Some(version) = source.version.as_deref().filter(|v| !v.is_empty()) {
            cmd.args(["--branch", version]);
        }
        cmd.arg(&source.url).arg(workspace);

        info!(url = source.url.as_str(), version = ?source.version, "cloning git repository");
        let output = cmd.output().await.map_err(|source| FetchError::Spawn {
            program: self.git_bin.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(FetchError::Git {
                url: source.url.clone(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let download_error = |source| FetchError::Download {
            url: url.to_string(),
            source,
        };
        let response = self.http.get(url).send().await.map_err(download_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(io_error(dest))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(download_error)?;
            file.write_all(&chunk).await.map_err(io_error(dest))?;
        }
        file.flush().await.map_err(io_error(dest))?;
        Ok(())
    }

    async fn fetch_archive(&self, url: &str, workspace: &Path) -> Result<PathBuf, FetchError> {
        let extension = archive_extension(url);
        let scratch = tempfile::Builder::new()
            .prefix("module-archive-")
            .tempdir()
            .map_err(io_error(workspace))?;
        let archive = scratch.path().join("archive");

        info!(url, "downloading module archive");
        self.download(url, &archive).await?;

        match extension.as_str() {
            ".zip" => {
                self.unzip(&archive, workspace).await?;
                single_top_level_dir(workspace).await
            }
            ".gz" | ".tgz" => {
                let target = workspace.join(GZIP_OUTPUT_FILE);
                decompress_gzip(archive, target).await?;
                Ok(workspace.to_path_buf())
            }
            other => Err(FetchError::UnsupportedArchive(other.to_string())),
        }
    }

    async fn unzip(&self, archive: &Path, workspace: &Path) -> Result<(), FetchError> {
        let output = Command::new(&self.unzip_bin)
            .args(["-q", "-o"])
            .arg(archive)
            .arg("-d")
            .arg(workspace)
            .output()
            .await
            .map_err(|source| FetchError::Spawn {
                program: self.unzip_bin.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(FetchError::Extract(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for CommandFetcher {
    async fn fetch(&self, source: &ModuleSource, workspace: &Path) -> Result<PathBuf, FetchError> {
        reset_workspace(workspace).await?;

        let root = match source.kind() {
            SourceKind::Git => {
                self.clone_git(source, workspace).await?;
                workspace.to_path_buf()
            }
            SourceKind::Http => self.fetch_archive(&source.url, workspace).await?,
            SourceKind::Local => {
                warn!(url = source.url.as_str(), "local module sources are not fetched");
                return Ok(workspace.to_path_buf());
            }
            SourceKind::Unknown(kind) => {
                warn!(source_type = kind.as_str(), "unknown module source type, nothing fetched");
                return Ok(workspace.to_path_buf());
            }
        };

        match source.sub_path() {
            Some(sub_path) => {
                let root = root.join(sub_path);
                if tokio::fs::metadata(&root).await.is_err() {
                    return Err(FetchError::MissingPath(sub_path.to_string()));
                }
                Ok(root)
            }
            None => Ok(root),
        }
    }
}

/// Remove and recreate the workspace so every fetch starts empty
pub async fn reset_workspace(workspace: &Path) -> Result<(), FetchError> {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(workspace)(e)),
    }
    tokio::fs::create_dir_all(workspace)
        .await
        .map_err(io_error(workspace))
}

/// Lower-cased extension of the URL's last path segment, including the dot
pub fn archive_extension(url: &str) -> String {
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let file_name = path.rsplit('/').next().unwrap_or_default();
    file_name
        .rfind('.')
        .map(|i| file_name[i..].to_ascii_lowercase())
        .unwrap_or_default()
}

/// The module root after extraction: the only sub-directory if there is exactly one and no
/// `.tf` file sits beside it. Archives with a root module plus nested `modules/` stay rooted
/// at the workspace.
async fn single_top_level_dir(workspace: &Path) -> Result<PathBuf, FetchError> {
    let mut entries = tokio::fs::read_dir(workspace)
        .await
        .map_err(io_error(workspace))?;
    let mut dirs = Vec::new();
    let mut top_level_tf = false;
    while let Some(entry) = entries.next_entry().await.map_err(io_error(workspace))? {
        let is_dir = entry
            .file_type()
            .await
            .map_err(io_error(workspace))?
            .is_dir();
        if is_dir {
            dirs.push(entry.path());
        } else if entry.path().extension().is_some_and(|ext| ext == "tf") {
            top_level_tf = true;
        }
    }
    if dirs.len() == 1 && !top_level_tf {
        let root = dirs.remove(0);
        debug!(root = %root.display(), "using single top-level directory as module root");
        return Ok(root);
    }
    Ok(workspace.to_path_buf())
}

async fn decompress_gzip(archive: PathBuf, target: PathBuf) -> Result<(), FetchError> {
    let task_target = target.clone();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        let input = std::fs::File::open(&archive)?;
        let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(input));
        let mut output = std::fs::File::create(&task_target)?;
        std::io::copy(&mut decoder, &mut output)
    })
    .await
    .map_err(|e| FetchError::Extract(e.to_string()))?;
    result
        .map(|bytes| debug!(bytes, "decompressed gzip stream"))
        .map_err(|e| FetchError::Extract(format!("{}: {e}", target.display())))
}
