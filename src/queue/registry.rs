//! The permission queue.
//!
//! Owns every active and historical [`PermissionRequest`], mints the
//! monotonic `req-N` ids, holds one waiter per pending request, and
//! broadcasts lifecycle events to in-process subscribers (audit relay,
//! WebSocket fan-out).
//!
//! # Waiters
//!
//! Each `request` registers a oneshot sender keyed by the new id and
//! hands the receiver back to the caller. `resolve` removes the sender
//! and fires it exactly once with `true` for approval. The sender is
//! consumed by the send, so double-signaling is unrepresentable.
//!
//! # Ordering
//!
//! Events are emitted while the registry lock is held, so subscribers
//! observe `Request` before the matching `Resolve`, and supersession
//! resolutions before the superseding request's insertion.
//!
//! # Persistence
//!
//! Mutations schedule a coalesced flush of the full request list roughly
//! 100 ms later. Losing one coalesce window on crash is acceptable;
//! waiters are in-memory only and are never persisted.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::types::{Category, PermissionRequest, QueueEvent, RequestStatus, ResolvedBy};
use crate::audit::{AuditEntry, AuditLog};

/// Delay before a scheduled persistence flush runs.
const FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Default window for [`PermissionQueue::recent`].
pub const DEFAULT_RECENT_LIMIT: usize = 50;

struct Inner {
    /// All requests in insertion order.
    requests: Vec<PermissionRequest>,
    /// id -> index into `requests`.
    index: HashMap<String, usize>,
    /// Pending waiters by request id.
    waiters: HashMap<String, oneshot::Sender<bool>>,
    /// Next `req-N` suffix.
    counter: u64,
}

/// The in-process permission request registry.
pub struct PermissionQueue {
    inner: Mutex<Inner>,
    events: broadcast::Sender<QueueEvent>,
    audit: AuditLog,
    persist_path: Option<PathBuf>,
    flush_scheduled: AtomicBool,
}

impl PermissionQueue {
    /// Create a queue. `persist_path` is the JSON file the request list
    /// is flushed to; `None` disables persistence (tests).
    pub fn new(persist_path: Option<PathBuf>, audit: AuditLog) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                requests: Vec::new(),
                index: HashMap::new(),
                waiters: HashMap::new(),
                counter: 0,
            }),
            events,
            audit,
            persist_path,
            flush_scheduled: AtomicBool::new(false),
        })
    }

    /// Load persisted requests and restore the id counter from the
    /// maximum observed `req-N`. Historical records are terminal, so no
    /// waiters are re-created.
    pub fn init(&self) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("Failed to read {:?}: {}", path, e);
                return;
            }
        };
        let requests: Vec<PermissionRequest> = match serde_json::from_str(&contents) {
            Ok(requests) => requests,
            Err(e) => {
                warn!("Ignoring corrupt queue file {:?}: {}", path, e);
                return;
            }
        };

        let mut inner = self.inner.lock().unwrap();
        inner.counter = requests
            .iter()
            .filter_map(|r| r.id.strip_prefix("req-")?.parse::<u64>().ok())
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);
        inner.index = requests
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        debug!("Restored {} persisted requests", requests.len());
        inner.requests = requests;
    }

    /// Subscribe to queue lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Insert a new pending request and return it together with its
    /// waiter.
    ///
    /// For filesystem requests carrying `metadata.targetFile`, any
    /// pending filesystem request for the same file is superseded first:
    /// denied with `resolvedBy: auto`, its waiter signaled `false`. The
    /// supersession is observable before the new id exists.
    pub fn request(
        self: &Arc<Self>,
        category: Category,
        action: String,
        description: String,
        reason: Option<String>,
        metadata: Map<String, Value>,
    ) -> (PermissionRequest, oneshot::Receiver<bool>) {
        let mut audit_entries = Vec::new();
        let (request, rx) = {
            let mut inner = self.inner.lock().unwrap();

            if category == Category::Filesystem {
                if let Some(target) = metadata.get("targetFile").and_then(Value::as_str) {
                    let stale: Vec<String> = inner
                        .requests
                        .iter()
                        .filter(|r| {
                            r.status == RequestStatus::Pending
                                && r.category == Category::Filesystem
                                && r.target_file() == Some(target)
                        })
                        .map(|r| r.id.clone())
                        .collect();
                    for id in stale {
                        if let Some(entry) =
                            resolve_locked(&mut inner, &id, RequestStatus::Denied, ResolvedBy::Auto)
                        {
                            debug!("Superseded pending filesystem request {}", entry.request.id);
                            self.emit(QueueEvent::Resolve(entry.request.clone()));
                            audit_entries.push(entry.audit);
                        }
                    }
                }
            }

            let id = format!("req-{}", inner.counter);
            inner.counter += 1;

            let request = PermissionRequest::new(
                id.clone(),
                category,
                action,
                description,
                reason,
                metadata,
            );
            let (tx, rx) = oneshot::channel();
            let idx = inner.requests.len();
            inner.requests.push(request.clone());
            inner.index.insert(id.clone(), idx);
            inner.waiters.insert(id, tx);

            self.emit(QueueEvent::Request(request.clone()));
            (request, rx)
        };

        for entry in audit_entries {
            self.audit_fire_and_forget(entry);
        }
        self.schedule_flush();
        (request, rx)
    }

    /// Transition a pending request to `approved` or `denied`.
    ///
    /// Returns false with no side effects when the id is unknown or the
    /// request is already terminal.
    pub fn resolve(
        self: &Arc<Self>,
        id: &str,
        status: RequestStatus,
        resolved_by: ResolvedBy,
    ) -> bool {
        if status == RequestStatus::Pending {
            return false;
        }

        let resolved = {
            let mut inner = self.inner.lock().unwrap();
            let resolved = resolve_locked(&mut inner, id, status, resolved_by);
            if let Some(ref entry) = resolved {
                self.emit(QueueEvent::Resolve(entry.request.clone()));
            }
            resolved
        };

        match resolved {
            Some(entry) => {
                self.audit_fire_and_forget(entry.audit);
                self.schedule_flush();
                true
            }
            None => false,
        }
    }

    pub fn approve(self: &Arc<Self>, id: &str, by: ResolvedBy) -> bool {
        self.resolve(id, RequestStatus::Approved, by)
    }

    pub fn deny(self: &Arc<Self>, id: &str, by: ResolvedBy) -> bool {
        self.resolve(id, RequestStatus::Denied, by)
    }

    /// Resolve every pending request of a category, in insertion order.
    /// Returns how many were resolved.
    pub fn bulk_resolve(
        self: &Arc<Self>,
        category: Category,
        status: RequestStatus,
        resolved_by: ResolvedBy,
    ) -> usize {
        let ids: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .requests
                .iter()
                .filter(|r| r.status == RequestStatus::Pending && r.category == category)
                .map(|r| r.id.clone())
                .collect()
        };

        let mut count = 0;
        for id in ids {
            if self.resolve(&id, status, resolved_by) {
                count += 1;
            }
        }
        count
    }

    /// All pending requests, insertion order.
    pub fn pending(&self) -> Vec<PermissionRequest> {
        self.inner
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect()
    }

    /// The most recent `limit` requests, newest first.
    pub fn recent(&self, limit: usize) -> Vec<PermissionRequest> {
        let inner = self.inner.lock().unwrap();
        inner.requests.iter().rev().take(limit).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<PermissionRequest> {
        let inner = self.inner.lock().unwrap();
        inner
            .index
            .get(id)
            .and_then(|&idx| inner.requests.get(idx))
            .cloned()
    }

    /// Write the full request list to disk immediately.
    pub fn flush(&self) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        let snapshot = {
            let inner = self.inner.lock().unwrap();
            serde_json::to_string_pretty(&inner.requests)
                .expect("request serialization cannot fail")
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(path, snapshot) {
            warn!("Failed to persist queue to {:?}: {}", path, e);
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine; broadcast just drops the event.
        let _ = self.events.send(event);
    }

    fn audit_fire_and_forget(&self, entry: AuditEntry) {
        let audit = self.audit.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || audit.append(&entry));
            }
            Err(_) => audit.append(&entry),
        }
    }

    /// Coalesce persistence: the first mutation arms a flush ~100 ms
    /// out; later mutations inside the window piggyback on it.
    fn schedule_flush(self: &Arc<Self>) {
        if self.persist_path.is_none() {
            return;
        }
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(FLUSH_DELAY).await;
                    queue.flush_scheduled.store(false, Ordering::SeqCst);
                    queue.flush();
                });
            }
            Err(_) => {
                self.flush_scheduled.store(false, Ordering::SeqCst);
                self.flush();
            }
        }
    }
}

struct Resolved {
    request: PermissionRequest,
    audit: AuditEntry,
}

/// Apply a resolution under the registry lock. Returns `None` when the
/// id is unknown or the request is not pending.
fn resolve_locked(
    inner: &mut Inner,
    id: &str,
    status: RequestStatus,
    resolved_by: ResolvedBy,
) -> Option<Resolved> {
    let idx = *inner.index.get(id)?;
    let request = &mut inner.requests[idx];
    if request.status != RequestStatus::Pending {
        return None;
    }

    let now = Utc::now().timestamp_millis();
    request.status = status;
    request.resolved_at = Some(now);
    request.resolved_by = Some(resolved_by);
    let snapshot = request.clone();

    // Auto decisions never waited on an operator; a duration would just
    // measure scheduler noise.
    let duration_ms = match resolved_by {
        ResolvedBy::Auto => None,
        _ => Some(now - snapshot.created_at),
    };
    let audit = AuditEntry {
        timestamp: now,
        id: snapshot.id.clone(),
        category: snapshot.category,
        action: snapshot.action.clone(),
        decision: match status {
            RequestStatus::Approved => "approved".to_string(),
            _ => "denied".to_string(),
        },
        resolved_by: Some(resolved_by),
        duration_ms,
        metadata: None,
    };

    if let Some(waiter) = inner.waiters.remove(id) {
        // Receiver may be gone (caller hung up); that is not an error.
        let _ = waiter.send(status == RequestStatus::Approved);
    }

    Some(Resolved {
        request: snapshot,
        audit,
    })
}
