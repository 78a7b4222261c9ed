use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

/// 活跃连接信息
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub target: String,
    pub upstream: Option<String>,
    #[serde(skip)]
    pub started: Instant,
    pub upload: u64,
    pub download: u64,
}

/// 连接跟踪器
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: Mutex<HashMap<u64, ConnectionInfo>>,
    next_id: AtomicU64,
    total_upload: AtomicU64,
    total_download: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始跟踪一个连接，返回的守卫 Drop 时注销
    pub fn track(self: &Arc<Self>, target: impl Into<String>, upstream: Option<&str>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let info = ConnectionInfo {
            id,
            target: target.into(),
            upstream: upstream.map(str::to_string),
            started: Instant::now(),
            upload: 0,
            download: 0,
        };
        debug!(id, target = %info.target, upstream = ?info.upstream, "connection tracked");
        self.lock().insert(id, info);
        ConnectionGuard {
            id,
            tracker: Arc::clone(self),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConnectionInfo>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self.lock().values().cloned().collect();
        list.sort_by_key(|c| c.id);
        list
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// 已关闭连接的累计流量
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_upload.load(Ordering::Relaxed),
            self.total_download.load(Ordering::Relaxed),
        )
    }
}

/// 连接守卫
#[derive(Debug)]
pub struct ConnectionGuard {
    id: u64,
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn add_traffic(&self, upload: u64, download: u64) {
        if let Some(info) = self.tracker.lock().get_mut(&self.id) {
            info.upload += upload;
            info.download += download;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(info) = self.tracker.lock().remove(&self.id) {
            self.tracker.total_upload.fetch_add(info.upload, Ordering::Relaxed);
            self.tracker.total_download.fetch_add(info.download, Ordering::Relaxed);
            debug!(
                id = self.id,
                up = info.upload,
                down = info.download,
                duration_ms = info.started.elapsed().as_millis() as u64,
                "connection closed"
            );
        }
    }
}
