use anyhow::{Result, Context};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use hex;

/// Storage trait for completed downloads and small keyed records.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Save a completed file under `name`, never overwriting an existing
    /// file. Returns the path actually written.
    async fn put_file(&self, name: &str, data: &[u8]) -> Result<PathBuf>;

    async fn put_record(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn get_record(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn remove_record(&self, key: &str) -> Result<()>;

    /// All records whose key starts with `prefix`.
    async fn list_records(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Local filesystem-based storage implementation.
#[derive(Clone)]
pub struct LocalStorage {
    files_dir: PathBuf,
    records_dir: PathBuf,
}

impl LocalStorage {
    /// Files are written to `base_dir/downloads`, records to `base_dir/store`.
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        Self::with_dirs(base_dir.join("downloads"), base_dir.join("store"))
    }

    pub fn with_dirs(files_dir: PathBuf, records_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&files_dir)
            .context("Failed to create downloads directory")?;
        std::fs::create_dir_all(&records_dir)
            .context("Failed to create record directory")?;

        Ok(Self { files_dir, records_dir })
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        // Keys contain '/', so store them hex-encoded
        self.records_dir.join(hex::encode(key.as_bytes()))
    }

    /// Candidate paths for `name`: `name`, then `stem (1).ext`, `stem (2).ext`, ...
    fn candidate_path(&self, name: &str, n: u32) -> PathBuf {
        if n == 0 {
            return self.files_dir.join(name);
        }

        let path = Path::new(name);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("download");
        let attempt = match path.extension().and_then(|s| s.to_str()) {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        self.files_dir.join(attempt)
    }
}

/// Strip any directory components a remote peer may have put in a name.
fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        "download".to_string()
    } else {
        base.to_string()
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put_file(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        let name = sanitize_file_name(name);

        let mut n = 0;
        let (path, mut file) = loop {
            let path = self.candidate_path(&name, n);
            // create_new claims the name atomically
            match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {}", path.display()))
                }
            }
        };

        file.write_all(data).await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.flush().await?;

        tracing::debug!("Saved {} ({} bytes)", path.display(), data.len());
        Ok(path)
    }

    async fn put_record(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.record_path(key);
        // Write then rename so concurrent readers never see a torn record
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await
            .with_context(|| format!("Failed to write record {}", key))?;
        fs::rename(&tmp, &path).await
            .with_context(|| format!("Failed to commit record {}", key))?;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(key);

        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path).await
            .with_context(|| format!("Failed to read record {}", key))?;
        Ok(Some(data))
    }

    async fn remove_record(&self, key: &str) -> Result<()> {
        let path = self.record_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove record {}", key)),
        }
    }

    async fn list_records(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.records_dir).await
            .context("Failed to list records")?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(encoded) = file_name.to_str() else { continue };

            // Skips in-flight .tmp files and anything not written by us
            let Some(key) = hex::decode(encoded).ok().and_then(|b| String::from_utf8(b).ok()) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }

            match fs::read(entry.path()).await {
                Ok(data) => out.push((key, data)),
                // Removed between listing and reading
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to read record {}", key)),
            }
        }

        Ok(out)
    }
}
