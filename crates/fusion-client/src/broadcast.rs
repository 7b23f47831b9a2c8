// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fan-out of one device position subscription to many listeners.
//!
//! The service is constructed once by the application and shared; it watches
//! the position source exactly once, however many listeners register.
//!
//! ```no_run
//! use fusion_client::broadcast::LocationBroadcastService;
//! use fusion_client::position::{GpsdSource, WatchOptions};
//!
//! # async fn example() {
//! let service = LocationBroadcastService::start(&GpsdSource::default(), WatchOptions::default()).await;
//! let id = service.register_callback(|position| {
//!     println!("at {}, {}", position.coords.latitude, position.coords.longitude);
//! });
//! service.unregister(id);
//! # }
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::position::{GeoPosition, PositionFeed, PositionSource, WatchOptions};

type Callback = Arc<dyn Fn(&GeoPosition) + Send + Sync>;

/// Handle returned by [`LocationBroadcastService::register_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    entries: RwLock<Vec<(ListenerId, Callback)>>,
    next_id: AtomicU64,
}

impl Listeners {
    fn snapshot(&self) -> Vec<(ListenerId, Callback)> {
        match self.entries.read() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn dispatch(&self, position: &GeoPosition) {
        // Listeners may register or unregister from inside a callback, so
        // dispatch runs on a snapshot without holding the lock.
        for (id, callback) in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| callback(position))).is_err() {
                error!("Location listener {:?} panicked", id);
            }
        }
    }
}

/// Shares one device position subscription with any number of listeners.
///
/// Listeners are called synchronously, in registration order, with the same
/// fix. A listener that panics is logged and skipped; the others still
/// receive the fix.
pub struct LocationBroadcastService {
    listeners: Arc<Listeners>,
    active: bool,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for LocationBroadcastService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationBroadcastService")
            .field("active", &self.active)
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl LocationBroadcastService {
    /// Watch `source` once and start fanning out its fixes.
    ///
    /// A device without positioning is logged and leaves the service
    /// inactive: listeners can still register but are never called.
    pub async fn start(source: &dyn PositionSource, options: WatchOptions) -> Self {
        let listeners = Arc::new(Listeners::default());
        let cancel_token = CancellationToken::new();

        let active = match source.watch(options).await {
            Ok(feed) => {
                info!("Location service active");
                tokio::spawn(dispatch_loop(
                    feed,
                    Arc::clone(&listeners),
                    cancel_token.clone(),
                ));
                true
            }
            Err(e) => {
                info!("Client does not support geolocation: {}", e);
                false
            }
        };

        Self {
            listeners,
            active,
            cancel_token,
        }
    }

    /// Register a function to be called on every position update.
    ///
    /// Registering the same function twice calls it twice.
    pub fn register_callback<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&GeoPosition) + Send + Sync + 'static,
    {
        let id = ListenerId(self.listeners.next_id.fetch_add(1, Ordering::Relaxed));
        let entry: (ListenerId, Callback) = (id, Arc::new(callback));
        match self.listeners.entries.write() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut entries = match self.listeners.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        match self.listeners.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Whether the position source accepted the subscription.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Stop dispatching. Registered listeners are kept but no longer called.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for LocationBroadcastService {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn dispatch_loop(mut feed: PositionFeed, listeners: Arc<Listeners>, cancel_token: CancellationToken) {
    loop {
        tokio::select! {
            update = feed.recv() => {
                match update {
                    Some(Ok(position)) => listeners.dispatch(&position),
                    Some(Err(e)) => debug!("Could not get position: {}", e),
                    None => {
                        info!("Position feed ended, location service idle");
                        return;
                    }
                }
            }

            () = cancel_token.cancelled() => return,
        }
    }
}
