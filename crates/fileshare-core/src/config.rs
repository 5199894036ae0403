use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Directory for the identity key, downloads and the local descriptor store
    pub data_dir: PathBuf,

    /// Name shown to other participants next to our shared files
    pub display_name: String,

    /// Port to listen on for incoming transfer channels
    pub listen_port: u16,

    /// mDNS service type
    pub service_type: String,

    /// Payload bytes per chunk message (1 KiB)
    pub chunk_size: usize,

    /// Store namespace holding file descriptors
    pub namespace: String,

    /// Tag used when opening transfer channels
    pub protocol_tag: String,

    /// Minimum gap between user-facing download progress updates
    pub progress_interval_ms: u64,

    /// Seconds a transfer may wait for the next message; 0 waits forever
    pub idle_timeout_secs: u64,

    /// Largest frame accepted from a peer
    pub max_frame_len: usize,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".fileshare"),
            display_name: "Guest".to_string(),
            listen_port: 9876,
            service_type: "_fileshare._tcp.local.".to_string(),
            chunk_size: 1024,
            namespace: "sharedFiles/".to_string(),
            protocol_tag: "fileSharingDownload".to_string(),
            progress_interval_ms: 250,
            idle_timeout_secs: 30,
            max_frame_len: crate::protocol::MAX_FRAME_LEN,
        }
    }
}

impl ShareConfig {
    pub fn with_display_name(mut self, display_name: String) -> Self {
        self.display_name = display_name;
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn ensure_data_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.data_dir.join("downloads"))?;
        std::fs::create_dir_all(self.data_dir.join("store"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: ShareConfig = serde_json::from_str(r#"{"display_name":"Ada","idle_timeout_secs":0}"#).unwrap();
        assert_eq!(cfg.display_name, "Ada");
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.namespace, "sharedFiles/");
        assert_eq!(cfg.idle_timeout(), None);
        assert_eq!(cfg.progress_interval(), Duration::from_millis(250));
    }
}
