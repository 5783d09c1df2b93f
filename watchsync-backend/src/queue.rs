//! Outbound request queue contract.
//!
//! The export planner enqueues converging play-state requests; a queue
//! consumer dispatches them later. Every request carries `user_data`
//! describing the target entity and the intended state so dispatch can be
//! logged meaningfully without re-resolving the entity.

use std::sync::Mutex;

use reqwest::Method;

/// Description of what a queued request is trying to achieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    pub backend: String,
    pub title: String,
    pub media_type: String,
    pub watched: bool,
    pub updated: i64,
}

/// A fully composed play-state request waiting for dispatch.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub user_data: UserData,
}

/// Sink for requests produced by the export planner.
pub trait RequestQueue {
    fn add(&self, request: QueuedRequest);
}

/// In-process queue backed by a `Vec`. The default consumer-side buffer,
/// and the test double for planner runs.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<Vec<QueuedRequest>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take every queued request, leaving the queue empty.
    pub fn drain(&self) -> Vec<QueuedRequest> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QueuedRequest>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RequestQueue for MemoryQueue {
    fn add(&self, request: QueuedRequest) {
        self.lock().push(request);
    }
}

/// Outcome counts from one dispatch pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub failed: u64,
}

/// Fire queued requests against their backends.
///
/// Failures are logged and counted, never retried; the planner will
/// re-produce the request on the next export run if the backend still
/// diverges.
pub async fn dispatch(http: &reqwest::Client, requests: Vec<QueuedRequest>) -> DispatchStats {
    let mut stats = DispatchStats::default();

    for request in requests {
        let action = if request.user_data.watched {
            "mark played"
        } else {
            "mark unplayed"
        };
        let mut builder = http.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => {
                log::info!(
                    "{} '{}' ({}) on {}",
                    action,
                    request.user_data.title,
                    request.user_data.media_type,
                    request.user_data.backend,
                );
                stats.dispatched += 1;
            }
            Ok(response) => {
                log::warn!(
                    "Failed to {} '{}' on {}: HTTP {}",
                    action,
                    request.user_data.title,
                    request.user_data.backend,
                    response.status(),
                );
                stats.failed += 1;
            }
            Err(e) => {
                log::warn!(
                    "Failed to {} '{}' on {}: {e}",
                    action,
                    request.user_data.title,
                    request.user_data.backend,
                );
                stats.failed += 1;
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(title: &str) -> QueuedRequest {
        QueuedRequest {
            method: Method::POST,
            url: "http://backend.local/PlayedItems/1".to_string(),
            headers: vec![],
            user_data: UserData {
                backend: "home".to_string(),
                title: title.to_string(),
                media_type: "movie".to_string(),
                watched: true,
                updated: 100,
            },
        }
    }

    #[test]
    fn memory_queue_accumulates_and_drains() {
        let queue = MemoryQueue::new();
        assert!(queue.is_empty());

        queue.add(request("a"));
        queue.add(request("b"));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].user_data.title, "a");
        assert!(queue.is_empty());
    }
}
