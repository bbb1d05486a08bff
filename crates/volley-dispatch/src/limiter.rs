//! Global outbound rate limiter.
//!
//! One limiter gates all outbound HTTP on the host: a token reservoir
//! (refilled wholesale on an interval), an in-flight cap, and a minimum
//! spacing between grants. Waiters are served strictly FIFO via tickets;
//! the queue is bounded by a high-water mark. The controller retunes
//! `max_concurrent`/`min_time` from the observed error rate and response
//! times, within fixed floors and ceilings.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use volley_core::{DispatchError, Result};

const MAX_CONCURRENT_CEILING: usize = 20;
const MAX_CONCURRENT_FLOOR: usize = 1;
const MIN_TIME_CEILING: Duration = Duration::from_millis(500);
const MIN_TIME_FLOOR: Duration = Duration::from_millis(50);

/// Initial limiter settings.
#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    pub max_concurrent: usize,
    pub min_time: Duration,
    pub reservoir: u32,
    pub reservoir_refresh: Duration,
    pub high_water: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            min_time: Duration::from_millis(100),
            reservoir: 100,
            reservoir_refresh: Duration::from_secs(60),
            high_water: 1000,
        }
    }
}

/// Settings snapshot for observability (`metrics:rateLimiter`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimiterSnapshot {
    pub max_concurrent: usize,
    pub min_time_ms: u64,
    pub queued: usize,
    pub in_flight: usize,
}

struct LimiterState {
    max_concurrent: usize,
    min_time: Duration,
    tokens: u32,
    last_refill: Instant,
    next_grant_at: Instant,
    in_flight: usize,
    next_ticket: u64,
    serving: u64,
    /// Tickets whose waiters were cancelled before being served. The queue
    /// head skips over them so a dropped `acquire` cannot stall admission.
    abandoned: std::collections::HashSet<u64>,
}

/// Token bucket + in-flight cap with FIFO admission.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
    notify: Notify,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Arc<Self> {
        let now = Instant::now();
        let state = LimiterState {
            max_concurrent: config.max_concurrent,
            min_time: config.min_time,
            tokens: config.reservoir,
            last_refill: now,
            next_grant_at: now,
            in_flight: 0,
            next_ticket: 0,
            serving: 0,
            abandoned: std::collections::HashSet::new(),
        };
        Arc::new(Self {
            config,
            state: Mutex::new(state),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut LimiterState, now: Instant) {
        if now.duration_since(state.last_refill) >= self.config.reservoir_refresh {
            state.tokens = self.config.reservoir;
            state.last_refill = now;
        }
    }

    /// Waits for a grant: FIFO position, a token, a free in-flight slot, and
    /// the minimum spacing. Fails fast when the waiting queue is at the
    /// high-water mark. Cancellation-safe: a dropped waiter's ticket is
    /// skipped instead of stalling the queue head.
    pub async fn acquire(self: &Arc<Self>) -> Result<RateLimitPermit> {
        let ticket = {
            let mut state = self.lock();
            let depth = (state.next_ticket - state.serving) as usize;
            if depth >= self.config.high_water {
                return Err(DispatchError::Pool(
                    "rate limiter queue at high water".into(),
                ));
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            ticket
        };
        let mut guard = TicketGuard {
            limiter: self,
            ticket,
            granted: false,
        };

        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                let now = Instant::now();
                self.refill(&mut state, now);
                while state.abandoned.remove(&state.serving) {
                    state.serving += 1;
                }
                if state.serving == ticket
                    && state.in_flight < state.max_concurrent
                    && state.tokens > 0
                    && now >= state.next_grant_at
                {
                    state.tokens -= 1;
                    state.in_flight += 1;
                    state.serving += 1;
                    state.next_grant_at = now + state.min_time;
                    guard.granted = true;
                    self.notify.notify_waiters();
                    return Ok(RateLimitPermit {
                        limiter: self.clone(),
                    });
                }
                if state.serving == ticket && state.in_flight < state.max_concurrent {
                    // Head of queue, blocked on spacing or tokens: wake at
                    // whichever deadline applies.
                    let mut at = state.next_grant_at;
                    if state.tokens == 0 {
                        at = at.max(state.last_refill + self.config.reservoir_refresh);
                    }
                    Some(at)
                } else {
                    None
                }
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// True when the waiting queue is past 80% of the high-water mark.
    pub fn is_limited(&self) -> bool {
        let state = self.lock();
        let depth = (state.next_ticket - state.serving) as usize;
        depth * 10 > self.config.high_water * 8
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.lock();
        LimiterSnapshot {
            max_concurrent: state.max_concurrent,
            min_time_ms: state.min_time.as_millis() as u64,
            queued: (state.next_ticket - state.serving) as usize,
            in_flight: state.in_flight,
        }
    }

    /// Retunes settings from the moving error rate and mean response time:
    /// back off on >10% errors, open up below 1% errors with sub-200ms
    /// responses.
    pub fn tune(&self, error_rate: f64, avg_response_ms: f64) -> LimiterSnapshot {
        {
            let mut state = self.lock();
            if error_rate > 0.10 {
                state.max_concurrent = ((state.max_concurrent as f64 * 0.8).floor() as usize)
                    .max(MAX_CONCURRENT_FLOOR);
                state.min_time = Duration::from_secs_f64(state.min_time.as_secs_f64() * 1.2)
                    .min(MIN_TIME_CEILING);
            } else if error_rate < 0.01 && avg_response_ms < 200.0 {
                state.max_concurrent = ((state.max_concurrent as f64 * 1.1).ceil() as usize)
                    .min(MAX_CONCURRENT_CEILING);
                state.min_time = Duration::from_secs_f64(state.min_time.as_secs_f64() * 0.9)
                    .max(MIN_TIME_FLOOR);
            }
        }
        self.notify.notify_waiters();
        self.snapshot()
    }
}

/// Marks a waiter's ticket abandoned when its `acquire` future is dropped
/// before being served.
struct TicketGuard<'a> {
    limiter: &'a RateLimiter,
    ticket: u64,
    granted: bool,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        let mut state = self.limiter.lock();
        if state.serving == self.ticket {
            state.serving += 1;
        } else {
            state.abandoned.insert(self.ticket);
        }
        drop(state);
        self.limiter.notify.notify_waiters();
    }
}

/// Held for the duration of one outbound call; releases its in-flight slot
/// on drop.
pub struct RateLimitPermit {
    limiter: Arc<RateLimiter>,
}

impl Drop for RateLimitPermit {
    fn drop(&mut self) {
        let mut state = self.limiter.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.limiter.notify.notify_waiters();
    }
}
