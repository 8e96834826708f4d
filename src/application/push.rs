//! Push Channel
//!
//! Fan-out of per-challenge updates to subscribed WebSocket clients. Each
//! connection owns a bounded queue: on overflow the oldest state-carrying
//! event is dropped, terminal events are never dropped, and a connection
//! whose queue stays full for too long is disconnected.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;

use crate::domain::entities::challenge::ChallengeStatus;
use crate::domain::entities::payout::PayoutStatus;
use crate::domain::entities::position::Position;

const FULL_DISCONNECT_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct PositionBrief {
    pub id: i64,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub unrealized_pnl: Option<f64>,
}

impl PositionBrief {
    pub fn from_position(p: &Position, mark: Option<f64>) -> Self {
        Self {
            id: p.id,
            symbol: p.symbol.clone(),
            side: p.side.as_str().to_string(),
            qty: p.qty,
            leverage: p.leverage,
            entry_price: p.entry_price,
            unrealized_pnl: mark.map(|m| p.unrealized_pnl(m)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceUpdate {
    pub equity: f64,
    pub balance: f64,
    pub unrealized_pnl: f64,
    pub daily_drawdown_pct: f64,
    pub total_drawdown_pct: f64,
    pub phase: ChallengeStatus,
    pub positions: Vec<PositionBrief>,
    pub timestamp: DateTime<Utc>,
}

/// Events pushed to clients as `{"type": ..., "data": ...}` frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    BalanceUpdate(BalanceUpdate),
    PositionOpened { position: PositionBrief },
    PositionClosed { position: PositionBrief, reason: String, realized_pnl: f64 },
    PhaseTransition { from: ChallengeStatus, to: ChallengeStatus },
    PayoutStatus { payout_id: i64, status: PayoutStatus },
    RiskWarning { kind: String, value_pct: f64, limit_pct: f64 },
}

impl PushEvent {
    /// State-carrying updates may be dropped under backpressure; terminal
    /// events never are.
    fn is_droppable(&self) -> bool {
        matches!(
            self,
            PushEvent::BalanceUpdate(_) | PushEvent::RiskWarning { .. }
        )
    }
}

struct SubscriberState {
    queue: VecDeque<PushEvent>,
    full_since: Option<Instant>,
    closed: bool,
}

struct Subscriber {
    id: u64,
    state: std::sync::Mutex<SubscriberState>,
    notify: Notify,
}

/// Per-challenge subscriber registry.
pub struct PushHub {
    capacity: usize,
    next_id: AtomicU64,
    conns: std::sync::Mutex<HashMap<i64, Vec<Arc<Subscriber>>>>,
}

impl PushHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            next_id: AtomicU64::new(1),
            conns: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, challenge_id: i64) -> PushReceiver {
        let subscriber = Arc::new(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: std::sync::Mutex::new(SubscriberState {
                queue: VecDeque::new(),
                full_since: None,
                closed: false,
            }),
            notify: Notify::new(),
        });
        let mut conns = self.conns.lock().expect("push hub poisoned");
        conns.entry(challenge_id).or_default().push(subscriber.clone());
        PushReceiver {
            challenge_id,
            subscriber,
        }
    }

    /// Deliver an event to every subscriber of the challenge, in emission
    /// order per connection.
    pub fn publish(&self, challenge_id: i64, event: &PushEvent) {
        let subscribers = {
            let mut conns = self.conns.lock().expect("push hub poisoned");
            let Some(list) = conns.get_mut(&challenge_id) else {
                return;
            };
            list.retain(|s| !s.state.lock().expect("subscriber poisoned").closed);
            if list.is_empty() {
                conns.remove(&challenge_id);
                return;
            }
            list.clone()
        };

        for subscriber in subscribers {
            let mut state = subscriber.state.lock().expect("subscriber poisoned");
            if state.closed {
                continue;
            }

            if state.queue.len() >= self.capacity {
                // Buffer continuously full for too long: the client is not
                // keeping up, cut it loose.
                if let Some(since) = state.full_since {
                    if since.elapsed() > FULL_DISCONNECT_AFTER {
                        warn!(
                            "disconnecting slow push subscriber {} on challenge {}",
                            subscriber.id, challenge_id
                        );
                        state.closed = true;
                        drop(state);
                        subscriber.notify.notify_one();
                        continue;
                    }
                } else {
                    state.full_since = Some(Instant::now());
                }

                if let Some(drop_at) = state.queue.iter().position(|e| e.is_droppable()) {
                    state.queue.remove(drop_at);
                    state.queue.push_back(event.clone());
                } else if !event.is_droppable() {
                    // Nothing droppable buffered: grow past capacity rather
                    // than lose a terminal event.
                    state.queue.push_back(event.clone());
                }
                // A droppable event arriving at a terminal-only queue is
                // discarded outright.
            } else {
                state.full_since = None;
                state.queue.push_back(event.clone());
            }
            drop(state);
            subscriber.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self, challenge_id: i64) -> usize {
        let conns = self.conns.lock().expect("push hub poisoned");
        conns.get(&challenge_id).map(|l| l.len()).unwrap_or(0)
    }
}

/// Receiving half held by a WebSocket connection task.
pub struct PushReceiver {
    challenge_id: i64,
    subscriber: Arc<Subscriber>,
}

impl PushReceiver {
    /// Next event in order, or None once the hub disconnected this client.
    pub async fn recv(&self) -> Option<PushEvent> {
        loop {
            {
                let mut state = self.subscriber.state.lock().expect("subscriber poisoned");
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.subscriber.notify.notified().await;
        }
    }

    pub fn challenge_id(&self) -> i64 {
        self.challenge_id
    }
}

impl Drop for PushReceiver {
    fn drop(&mut self) {
        let mut state = self.subscriber.state.lock().expect("subscriber poisoned");
        state.closed = true;
    }
}
