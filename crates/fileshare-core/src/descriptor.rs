use serde::{Serialize, Deserialize};
use serde_json::Value;
use anyhow::{Result, Context};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Published metadata for one shared file. Field names on the wire match
/// what other session participants already write into the shared store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    #[serde(rename = "uuid")]
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// Unix milliseconds at which the file was shared
    #[serde(default)]
    pub date: u64,
    /// Participant id of the sharer
    pub owner: String,
    #[serde(rename = "ownerName", default)]
    pub owner_name: String,
}

impl FileDescriptor {
    /// Parse an untrusted store entry. Anything missing an id, name, size or
    /// owner (or with the wrong types) is rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let descriptor: Self = serde_json::from_value(value.clone()).ok()?;
        if descriptor.id.is_empty() || descriptor.name.is_empty() || descriptor.owner.is_empty() {
            return None;
        }
        Some(descriptor)
    }

    pub fn to_value(&self) -> Value {
        // A struct of strings and integers always serializes
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn owner_label(&self) -> &str {
        if self.owner_name.is_empty() {
            "Guest"
        } else {
            &self.owner_name
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        format!(
            "{} ({}, shared by {})",
            self.name,
            format_file_size(self.size),
            self.owner_label()
        )
    }
}

/// A file we are sharing, held in memory for as long as we share it.
#[derive(Debug, Clone)]
pub struct SharedFile {
    /// Assigned when the file is first shared
    pub id: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub data: Arc<Vec<u8>>,
}

impl SharedFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: None,
            name: name.into(),
            mime_type: mime_type.into(),
            data: Arc::new(data),
        }
    }

    /// Read a file from disk into memory.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;

        // Extract just the filename, not the full path
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime_type = mime_type_for(&name).to_string();

        Ok(Self::new(name, mime_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// The in-memory result of a completed transfer (or a local share).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArtifact {
    pub name: String,
    pub mime_type: String,
    pub data: Arc<Vec<u8>>,
}

impl FileArtifact {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: Arc::new(data),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl From<SharedFile> for FileArtifact {
    fn from(file: SharedFile) -> Self {
        Self {
            name: file.name,
            mime_type: file.mime_type,
            data: file.data,
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Best-effort content type from a file extension.
pub fn mime_type_for(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") {
        return "application/gzip";
    }

    let ext = lower.rsplit('.').next().unwrap_or("");
    match ext {
        "txt" => "text/plain",
        "htm" | "html" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "js" => "text/javascript",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "rtf" => "application/rtf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "psd" => "image/vnd.adobe.photoshop",
        "mp3" => "audio/mpeg",
        "mp4" | "m4v" => "video/mp4",
        "avi" => "video/x-msvideo",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "zip" => "application/zip",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/vnd.rar",
        "tar" => "application/x-tar",
        "apk" => "application/vnd.android.package-archive",
        "iso" => "application/x-iso9660-image",
        _ => "application/octet-stream",
    }
}

/// Human readable byte count, e.g. `1.5 KB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
