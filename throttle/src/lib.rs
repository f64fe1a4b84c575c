//! Concurrency slots and launch rate limiting for file distribution
//!
//! This crate provides the two resource controls used by the distribution scheduler.
//!
//! # Overview
//!
//! 1. **Concurrency slots** - [`Slots`] bounds how many transfer workers may be active at the
//!    same time. Each active worker holds one [`Slot`]; dropping it frees the slot.
//! 2. **Launch throttle** - an optional token bucket limiting how many workers are started per
//!    second, which keeps a large fan-out from opening hundreds of SSH connections at once.
//!
//! # Usage Patterns
//!
//! ## Concurrency Slots
//!
//! ```rust,no_run
//! use throttle::Slots;
//!
//! # async fn example() -> Result<(), tokio::sync::AcquireError> {
//! let slots = Slots::new(250);
//! let slot = slots.acquire().await?;
//! tokio::spawn(async move {
//!     // run the transfer here - the slot is released when `slot` is dropped
//!     drop(slot);
//! });
//! # Ok(())
//! # }
//! ```
//!
//! ## Launch Throttling
//!
//! ```rust,no_run
//! use throttle::{init_launch_tokens, run_launch_replenish_thread, get_launch_token};
//! use std::time::Duration;
//!
//! # async fn example() {
//! // 20 launches per second
//! init_launch_tokens(2);
//! tokio::spawn(run_launch_replenish_thread(2, Duration::from_millis(100)));
//!
//! get_launch_token().await;
//! // start a worker here
//! # }
//! ```
//!
//! # Replenishment Strategy
//!
//! Launch tokens are replenished by a background task that periodically tops the bucket up to
//! `tokens_per_interval`. When the throttle is not initialized, [`get_launch_token`] returns
//! immediately.

mod semaphore;
mod slots;

pub use slots::{Slot, Slots};

static LAUNCH_THROTTLE: semaphore::TokenBucket = semaphore::TokenBucket::new();

pub fn init_launch_tokens(tokens: usize) {
    LAUNCH_THROTTLE.setup(tokens);
}

pub async fn get_launch_token() {
    LAUNCH_THROTTLE.consume().await;
}

pub async fn run_launch_replenish_thread(replenish: usize, interval: std::time::Duration) {
    LAUNCH_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}
