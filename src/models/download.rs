use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use reqwest::{
    blocking::Client,
    header::{CONTENT_RANGE, RANGE},
    StatusCode,
};
use tracing::{debug, info, warn};

use super::{metadata::compute_sha256, records::DownloadConfig};

pub const CHUNK_SIZE: usize = 8 * 1024;
pub const MODEL_FILE_EXTENSION: &str = "tflite";

/// Deterministic on-disk name so a resumed attempt targets the same file.
pub fn artifact_file_name(model_id: &str, version: i32) -> String {
    format!("{model_id}_v{version}.{MODEL_FILE_EXTENSION}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    pub uri: String,
    pub destination: PathBuf,
}

impl DownloadPlan {
    pub fn for_model(model_id: &str, config: &DownloadConfig, files_dir: &Path) -> Self {
        Self {
            uri: config.download_url.clone(),
            destination: files_dir.join(artifact_file_name(model_id, config.version)),
        }
    }

    /// Bytes left behind by an earlier, interrupted attempt.
    #[must_use]
    pub fn existing_bytes(&self) -> u64 {
        fs::metadata(&self.destination)
            .map(|meta| meta.len())
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct DownloadOutcome {
    pub final_path: PathBuf,
    pub resumed_from: u64,
    pub bytes_downloaded: u64,
    pub size_bytes: u64,
    pub checksum: String,
}

pub fn download_model_file(client: &Client, plan: &DownloadPlan) -> Result<DownloadOutcome> {
    download_with_progress(client, plan, |_| {})
}

/// Streams `plan.uri` into `plan.destination`, resuming from a partial file
/// with a byte-range request. On failure the partial file is kept so the
/// next attempt can pick up where this one stopped.
pub fn download_with_progress<F>(
    client: &Client,
    plan: &DownloadPlan,
    mut progress: F,
) -> Result<DownloadOutcome>
where
    F: FnMut(u64),
{
    if let Some(parent) = plan.destination.parent() {
        fs::create_dir_all(parent).context("create model directory")?;
    }

    let resumed_from = plan.existing_bytes();
    let bytes_downloaded = download_to_file(client, plan, resumed_from, &mut progress)?;

    let size_bytes = fs::metadata(&plan.destination)
        .context("stat downloaded file")?
        .len();
    let checksum = compute_sha256(&plan.destination)?;

    Ok(DownloadOutcome {
        final_path: plan.destination.clone(),
        resumed_from,
        bytes_downloaded,
        size_bytes,
        checksum,
    })
}

fn download_to_file<F>(
    client: &Client,
    plan: &DownloadPlan,
    resume_from: u64,
    progress: &mut F,
) -> Result<u64>
where
    F: FnMut(u64),
{
    let mut request = client.get(&plan.uri);
    if resume_from > 0 {
        request = request.header(RANGE, format!("bytes={resume_from}-"));
    }
    let response = request
        .send()
        .with_context(|| format!("request {}", plan.uri))?;

    if resume_from > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        return finish_unsatisfiable_range(plan, resume_from, &response);
    }

    let mut response = response
        .error_for_status()
        .with_context(|| format!("download {}", plan.uri))?;

    let append = resume_from > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    if resume_from > 0 && !append {
        warn!(
            uri = %plan.uri,
            "server ignored range request; restarting download from the first byte"
        );
    }

    let mut file = if append {
        OpenOptions::new()
            .append(true)
            .open(&plan.destination)
            .context("open partial model file")?
    } else {
        File::create(&plan.destination).context("create model file")?
    };

    let base = if append { resume_from } else { 0 };
    let mut downloaded = 0u64;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = response.read(&mut buffer).context("read download chunk")?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .context("write download chunk")?;
        downloaded += read as u64;
        progress(base + downloaded);
    }
    file.flush().context("flush model file")?;
    Ok(downloaded)
}

/// A 416 answer to a resume request means the partial file is either already
/// complete or stale. Only the first case is a success.
fn finish_unsatisfiable_range(
    plan: &DownloadPlan,
    resume_from: u64,
    response: &reqwest::blocking::Response,
) -> Result<u64> {
    let total = response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit('/').next())
        .and_then(|value| value.trim().parse::<u64>().ok());

    if total == Some(resume_from) {
        debug!(path = %plan.destination.display(), "model file already complete");
        return Ok(0);
    }

    let _ = fs::remove_file(&plan.destination);
    Err(anyhow!(
        "stale partial download for {} ({} bytes on disk, remote size {:?})",
        plan.uri,
        resume_from,
        total
    ))
}

/// Fetches a model artifact and returns its absolute local path.
pub trait ModelDownloader: Send + Sync {
    fn download(&self, model_id: &str, config: &DownloadConfig) -> Result<PathBuf>;
}

pub struct HttpDownloader {
    files_dir: PathBuf,
    client: OnceCell<Client>,
}

impl HttpDownloader {
    pub fn new(files_dir: impl Into<PathBuf>) -> Self {
        Self {
            files_dir: files_dir.into(),
            client: OnceCell::new(),
        }
    }

    pub fn files_dir(&self) -> &Path {
        self.files_dir.as_path()
    }

    pub fn plan_for(&self, model_id: &str, config: &DownloadConfig) -> DownloadPlan {
        DownloadPlan::for_model(model_id, config, &self.files_dir)
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| Client::builder().build().context("create http client"))
    }
}

impl ModelDownloader for HttpDownloader {
    fn download(&self, model_id: &str, config: &DownloadConfig) -> Result<PathBuf> {
        let plan = self.plan_for(model_id, config);
        let outcome = download_model_file(self.client()?, &plan)?;
        info!(
            model = model_id,
            version = config.version,
            path = %outcome.final_path.display(),
            size = outcome.size_bytes,
            resumed_from = outcome.resumed_from,
            sha256 = %outcome.checksum,
            "model download finished"
        );
        let absolute = fs::canonicalize(&outcome.final_path).unwrap_or(outcome.final_path);
        Ok(absolute)
    }
}
