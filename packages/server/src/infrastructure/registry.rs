//! In-memory registry of active sessions and the broadcast fan-out.
//!
//! ## 責務
//!
//! - アクティブなセッションの集合を管理（register / remove / drain）
//! - 送信者を除外したブロードキャストと全員へのブロードキャスト
//! - 接続数の上限管理（admission）
//!
//! ## 設計ノート
//!
//! ブロードキャストは集合のスナップショットを取ってからロックを解放し、
//! 各宛先へ順に送信する。送信に失敗した宛先はループ後に取り除く。

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::domain::{Member, SessionId, Username, notice};

/// Proof that a connection was admitted under the capacity limit.
///
/// The slot is released when this is dropped.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

/// The set of currently active sessions.
pub struct SessionRegistry {
    members: Mutex<HashMap<SessionId, Arc<dyn Member>>>,
    admissions: Arc<Semaphore>,
    capacity: usize,
}

impl SessionRegistry {
    /// Create an empty registry admitting at most `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            admissions: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve a slot for a newly accepted connection.
    ///
    /// Slots are held from accept until the session is dropped, so
    /// connections still negotiating a username count against the limit.
    /// Returns `None` when the server is at capacity.
    pub fn try_admit(&self) -> Option<Admission> {
        self.admissions
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Admission { _permit: permit })
    }

    /// Add an active member.
    pub async fn register(&self, member: Arc<dyn Member>) {
        let id = member.id();
        let mut members = self.members.lock().await;
        members.insert(id, member);
        tracing::info!("Session {} registered. Total clients: {}", id, members.len());
    }

    /// Remove a member and announce its departure to everyone left.
    ///
    /// Removing an absent member is a no-op. Members whose delivery of the
    /// departure notice fails are removed (and announced) in turn.
    ///
    /// # Returns
    ///
    /// `true` if `id` was registered
    pub async fn remove(&self, id: &SessionId) -> bool {
        let Some(member) = self.take(id).await else {
            return false;
        };

        let mut departed = vec![member];
        while let Some(member) = departed.pop() {
            let Some(username) = member.username() else {
                continue;
            };
            let (_, failed) = self.fan_out(&notice::left(&username), None).await;
            for id in failed {
                departed.extend(self.take(&id).await);
            }
        }

        true
    }

    /// Deliver `line` to every member except `excluded`.
    ///
    /// # Returns
    ///
    /// The number of members the line was delivered to
    pub async fn broadcast_excluding(&self, line: &str, excluded: &SessionId) -> usize {
        tracing::debug!("Broadcasting (excluding {}): {}", excluded, line);
        let (delivered, failed) = self.fan_out(line, Some(excluded)).await;
        self.remove_failed(failed).await;
        delivered
    }

    /// Deliver `line` to every member.
    ///
    /// # Returns
    ///
    /// The number of members the line was delivered to
    pub async fn broadcast_to_all(&self, line: &str) -> usize {
        tracing::debug!("Broadcasting to all: {}", line);
        let (delivered, failed) = self.fan_out(line, None).await;
        self.remove_failed(failed).await;
        delivered
    }

    pub async fn count(&self) -> usize {
        self.members.lock().await.len()
    }

    /// Point-in-time snapshot of assigned usernames, in iteration order.
    pub async fn usernames(&self) -> Vec<Username> {
        self.snapshot()
            .await
            .iter()
            .filter_map(|member| member.username())
            .collect()
    }

    /// Empty the registry without announcing anyone's departure.
    pub async fn drain(&self) -> Vec<Arc<dyn Member>> {
        let mut members = self.members.lock().await;
        members.drain().map(|(_, member)| member).collect()
    }

    async fn take(&self, id: &SessionId) -> Option<Arc<dyn Member>> {
        let mut members = self.members.lock().await;
        let removed = members.remove(id);
        if removed.is_some() {
            tracing::info!("Session {} removed. Total clients: {}", id, members.len());
        }
        removed
    }

    async fn snapshot(&self) -> Vec<Arc<dyn Member>> {
        self.members.lock().await.values().cloned().collect()
    }

    /// Deliver to a snapshot of the members, sequentially, without holding
    /// the lock. Returns the delivery count and the ids that failed.
    async fn fan_out(&self, line: &str, excluded: Option<&SessionId>) -> (usize, Vec<SessionId>) {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for member in self.snapshot().await {
            let id = member.id();
            if Some(&id) == excluded {
                continue;
            }
            if !member.is_connected() {
                tracing::debug!("Session {} is not connected, skipping", id);
                continue;
            }
            // ブロードキャストでは一部の送信失敗を許容
            match member.deliver(line).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!("Failed to deliver to session {}: {}", id, e);
                    failed.push(id);
                }
            }
        }

        (delivered, failed)
    }

    async fn remove_failed(&self, failed: Vec<SessionId>) {
        for id in failed {
            self.remove(&id).await;
        }
    }
}
