use tokio::sync::watch;

use crate::connection::connection_state::CloseReason;

/// Resolved exactly once with the reason a connection ended. Later attempts to complete it are
///  ignored, so whichever failure is detected first determines the reason.
pub struct CloseSignal {
    reason: watch::Sender<Option<CloseReason>>,
}
impl Default for CloseSignal {
    fn default() -> Self {
        CloseSignal::new()
    }
}
impl CloseSignal {
    pub fn new() -> CloseSignal {
        CloseSignal {
            reason: watch::Sender::new(None),
        }
    }

    /// returns `true` if this call determined the close reason
    pub fn complete(&self, reason: CloseReason) -> bool {
        self.reason.send_if_modified(|r| {
            if r.is_none() {
                *r = Some(reason);
                true
            }
            else {
                false
            }
        })
    }

    pub fn get(&self) -> Option<CloseReason> {
        *self.reason.borrow()
    }

    pub fn is_completed(&self) -> bool {
        self.get().is_some()
    }

    pub async fn wait(&self) -> CloseReason {
        let mut rx = self.reason.subscribe();
        let result = rx.wait_for(|r| r.is_some()).await
            .ok()
            .and_then(|r| *r);
        // the sender lives in self, so waiting can only end with a reason
        result.unwrap_or(CloseReason::CleanClose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_completed());

        assert!(signal.complete(CloseReason::IoError));
        assert!(!signal.complete(CloseReason::CleanClose));
        assert_eq!(signal.get(), Some(CloseReason::IoError));
        assert_eq!(signal.wait().await, CloseReason::IoError);
    }

    #[tokio::test]
    async fn test_wait_before_completion() {
        let signal = Arc::new(CloseSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::task::yield_now().await;

        signal.complete(CloseReason::LameDuckMode);
        assert_eq!(waiter.await.unwrap(), CloseReason::LameDuckMode);
    }
}
