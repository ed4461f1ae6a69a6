use crate::events::{DashboardData, DashboardStats, RequestEvent};
use axum::extract::ws::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

const RECENT_ACTIVITY_CAP: usize = 50;
const WINDOW_RETENTION: Duration = Duration::from_secs(10);
const RPS_SPAN: Duration = Duration::from_secs(5);

/// Who a dashboard connection is. Admin sessions see every tenant; tenant
/// sessions see only their own traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberKind {
    Admin,
    Tenant(String),
}

struct Subscriber {
    kind: SubscriberKind,
    sender: mpsc::Sender<Message>,
}

#[derive(Default)]
struct Totals {
    requests: AtomicU64,
    blocked: AtomicU64,
    allowed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TenantTotals {
    requests: u64,
    blocked: u64,
    allowed: u64,
}

/// Per-process fan-out hub for live dashboards. Each connection owns a
/// bounded channel; a send that fails or would overflow drops only that
/// subscriber. Also keeps the rolling request window and the counters the
/// `/stats` endpoint reports.
pub struct TelemetryHub {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    totals: Totals,
    per_tenant: Mutex<HashMap<String, TenantTotals>>,
    recent: Mutex<VecDeque<RequestEvent>>,
    window: Mutex<VecDeque<Instant>>,
}

impl TelemetryHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            totals: Totals::default(),
            per_tenant: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_ACTIVITY_CAP)),
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn register(&self, kind: SubscriberKind, sender: mpsc::Sender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        self.subscribers
            .write()
            .await
            .insert(id, Subscriber { kind, sender });
        debug!(connection_id = %id, "Dashboard connection registered");
        id
    }

    pub async fn unregister(&self, id: &Uuid) {
        self.subscribers.write().await.remove(id);
        debug!(connection_id = %id, "Dashboard connection unregistered");
    }

    pub async fn connection_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Record a decision and fan it out. The event is stamped with the
    /// current rolling RPS before serialization.
    pub async fn publish(&self, mut event: RequestEvent) {
        self.totals.requests.fetch_add(1, Ordering::Relaxed);
        if event.waf_blocked {
            self.totals.blocked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.totals.allowed.fetch_add(1, Ordering::Relaxed);
        }
        {
            let mut per_tenant = self.per_tenant.lock().await;
            let totals = per_tenant.entry(event.client_id.clone()).or_default();
            totals.requests += 1;
            if event.waf_blocked {
                totals.blocked += 1;
            } else {
                totals.allowed += 1;
            }
        }

        event.requests_per_second = self.record_arrival().await;

        {
            let mut recent = self.recent.lock().await;
            if recent.len() == RECENT_ACTIVITY_CAP {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };

        let mut stale = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, subscriber) in subscribers.iter() {
                let interested = match &subscriber.kind {
                    SubscriberKind::Admin => true,
                    SubscriberKind::Tenant(client_id) => *client_id == event.client_id,
                };
                if !interested {
                    continue;
                }
                if subscriber
                    .sender
                    .try_send(Message::Text(payload.clone()))
                    .is_err()
                {
                    stale.push(*id);
                }
            }
        }
        if !stale.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in stale {
                subscribers.remove(&id);
                debug!(connection_id = %id, "Dropped unresponsive dashboard connection");
            }
        }
    }

    /// Snapshot for a freshly connected dashboard.
    pub async fn snapshot(&self, kind: &SubscriberKind) -> DashboardData {
        let stats = match kind {
            SubscriberKind::Admin => self.global_stats().await,
            SubscriberKind::Tenant(client_id) => {
                let per_tenant = self.per_tenant.lock().await;
                let totals = per_tenant.get(client_id).copied().unwrap_or_default();
                DashboardStats {
                    total_requests: totals.requests,
                    total_blocked: totals.blocked,
                    total_allowed: totals.allowed,
                    requests_per_second: self.rolling_rps().await,
                }
            }
        };
        let recent = self.recent.lock().await;
        let recent_activity = recent
            .iter()
            .filter(|event| match kind {
                SubscriberKind::Admin => true,
                SubscriberKind::Tenant(client_id) => event.client_id == *client_id,
            })
            .cloned()
            .collect();
        DashboardData {
            kind: "dashboard_data",
            stats,
            recent_activity,
        }
    }

    pub async fn global_stats(&self) -> DashboardStats {
        DashboardStats {
            total_requests: self.totals.requests.load(Ordering::Relaxed),
            total_blocked: self.totals.blocked.load(Ordering::Relaxed),
            total_allowed: self.totals.allowed.load(Ordering::Relaxed),
            requests_per_second: self.rolling_rps().await,
        }
    }

    /// Requests per second over the last five seconds.
    pub async fn rolling_rps(&self) -> f64 {
        let now = Instant::now();
        let mut window = self.window.lock().await;
        Self::prune(&mut window, now);
        let span_start = now.checked_sub(RPS_SPAN).unwrap_or(now);
        let count = window.iter().filter(|at| **at >= span_start).count();
        count as f64 / RPS_SPAN.as_secs_f64()
    }

    async fn record_arrival(&self) -> f64 {
        let now = Instant::now();
        let mut window = self.window.lock().await;
        window.push_back(now);
        Self::prune(&mut window, now);
        let span_start = now.checked_sub(RPS_SPAN).unwrap_or(now);
        let count = window.iter().filter(|at| **at >= span_start).count();
        count as f64 / RPS_SPAN.as_secs_f64()
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) > WINDOW_RETENTION {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new()
    }
}
