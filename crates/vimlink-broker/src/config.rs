use std::{path::PathBuf, time::Duration};
use vimlink_core::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/vim-mcp-server.sock";
pub const DEFAULT_STATE_DIR: &str = "/tmp";

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    /// State fetches, generic commands and macro recording.
    pub request_timeout: Duration,
    pub help_timeout: Duration,
    pub exit_timeout: Duration,
    /// Wait between sending a command and re-reading state.
    pub settle_delay: Duration,
    pub bind_retry_delay: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            request_timeout: Duration::from_secs(2),
            help_timeout: Duration::from_secs(3),
            exit_timeout: Duration::from_secs(2),
            settle_delay: Duration::from_millis(500),
            bind_retry_delay: Duration::from_secs(1),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 64,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
