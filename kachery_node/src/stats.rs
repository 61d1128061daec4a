//! Per-channel transfer accounting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Byte counters keyed by channel name. Cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    inner: Arc<Mutex<HashMap<String, ChannelStats>>>,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_bytes_sent(&self, channel_name: &str, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(channel_name.to_owned()).or_default().bytes_sent += n;
    }

    pub fn report_bytes_received(&self, channel_name: &str, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(channel_name.to_owned())
            .or_default()
            .bytes_received += n;
    }

    pub fn snapshot(&self) -> HashMap<String, ChannelStats> {
        self.inner.lock().unwrap().clone()
    }
}
