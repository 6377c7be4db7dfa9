use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DrawSession {
    pub user_id: i64,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct InFlightDraw {
    chat_id: i64,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
pub struct AppState {
    draw_sessions: Arc<Mutex<HashMap<i64, DrawSession>>>,
    in_flight: Arc<Mutex<HashMap<u64, InFlightDraw>>>,
    next_job_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the chat was already in drawing mode.
    pub fn enter_draw_mode(&self, chat_id: i64, user_id: i64) -> bool {
        let mut sessions = self.draw_sessions.lock();
        if sessions.contains_key(&chat_id) {
            return false;
        }
        sessions.insert(
            chat_id,
            DrawSession {
                user_id,
                entered_at: Utc::now(),
            },
        );
        true
    }

    /// Leaves drawing mode and cancels every drawing still running in the
    /// chat. Returns the number of cancelled drawings.
    pub fn leave_draw_mode(&self, chat_id: i64) -> usize {
        self.draw_sessions.lock().remove(&chat_id);
        let in_flight = self.in_flight.lock();
        let mut cancelled = 0;
        for draw in in_flight.values().filter(|draw| draw.chat_id == chat_id) {
            draw.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    pub fn draw_session(&self, chat_id: i64) -> Option<DrawSession> {
        self.draw_sessions.lock().get(&chat_id).cloned()
    }

    pub fn in_flight_count(&self, chat_id: i64) -> usize {
        self.in_flight
            .lock()
            .values()
            .filter(|draw| draw.chat_id == chat_id)
            .count()
    }

    /// Registers a running drawing; it is unregistered when the guard drops.
    pub fn begin_draw(&self, chat_id: i64) -> DrawJob {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.in_flight.lock().insert(
            job_id,
            InFlightDraw {
                chat_id,
                cancel: cancel.clone(),
            },
        );
        DrawJob {
            job_id,
            cancel,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

pub struct DrawJob {
    job_id: u64,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<HashMap<u64, InFlightDraw>>>,
}

impl DrawJob {
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for DrawJob {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.job_id);
    }
}
