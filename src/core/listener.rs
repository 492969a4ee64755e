//! # Lifecycle listeners and their per-controller delivery queue.
//!
//! Notices are queued while the controller lock is held and delivered after it is
//! released, so listeners may call back into the controller. Each controller
//! delivers FIFO through one drainer at a time:
//!
//! ```text
//! transition under lock ──► ListenerQueue::push(notice)
//! lock released        ──► ListenerQueue::drain(ctl)
//!                              ├─ another thread draining? → return (it will see our notice)
//!                              └─ pop front → listener.transition(..) → repeat until empty
//! ```
//!
//! Dependency failure notices still queued when the controller is cancelled or
//! removed are dropped at delivery.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::service::State;
use crate::subscribers::panic_message;

use super::controller::ServiceController;

/// Observer of one controller's lifecycle.
///
/// Every method has a no-op default. Methods run synchronously on whichever
/// thread completed the transition; keep them short.
pub trait LifecycleListener: Send + Sync + 'static {
    fn transition(&self, controller: &ServiceController, from: State, to: State) {
        let _ = (controller, from, to);
    }

    /// A required dependency failed to start (first failure only).
    fn dependency_failed(&self, controller: &ServiceController) {
        let _ = controller;
    }

    /// The last failed required dependency recovered.
    fn dependency_failure_cleared(&self, controller: &ServiceController) {
        let _ = controller;
    }

    /// The controller was removed from its registry.
    fn removed(&self, controller: &ServiceController) {
        let _ = controller;
    }
}

/// Shared handle to a listener.
pub type ListenerRef = Arc<dyn LifecycleListener>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Notice {
    Transition(State, State),
    DependencyFailed,
    DependencyFailureCleared,
    Removed,
}

impl Notice {
    fn concerns_dependencies(&self) -> bool {
        matches!(self, Notice::DependencyFailed | Notice::DependencyFailureCleared)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Notice>,
    draining: bool,
}

/// Serializing delivery queue.
#[derive(Default)]
pub(crate) struct ListenerQueue {
    listeners: Mutex<Vec<ListenerRef>>,
    state: Mutex<QueueState>,
}

impl ListenerQueue {
    pub(crate) fn add(&self, listener: ListenerRef) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn remove(&self, listener: &ListenerRef) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn push(&self, notice: Notice) {
        self.state.lock().pending.push_back(notice);
    }

    /// Delivers queued notices unless another thread is already doing so.
    pub(crate) fn drain(&self, controller: &ServiceController) {
        {
            let mut st = self.state.lock();
            if st.draining || st.pending.is_empty() {
                return;
            }
            st.draining = true;
        }
        loop {
            let notice = {
                let mut st = self.state.lock();
                match st.pending.pop_front() {
                    Some(n) => n,
                    None => {
                        st.draining = false;
                        return;
                    }
                }
            };
            if notice.concerns_dependencies() && controller.state().is_gone() {
                continue;
            }
            let listeners = self.listeners.lock().clone();
            for listener in &listeners {
                deliver(listener, controller, notice);
            }
        }
    }
}

fn deliver(listener: &ListenerRef, controller: &ServiceController, notice: Notice) {
    let call = std::panic::AssertUnwindSafe(|| match notice {
        Notice::Transition(from, to) => listener.transition(controller, from, to),
        Notice::DependencyFailed => listener.dependency_failed(controller),
        Notice::DependencyFailureCleared => listener.dependency_failure_cleared(controller),
        Notice::Removed => listener.removed(controller),
    });
    if let Err(panic) = std::panic::catch_unwind(call) {
        tracing::error!(
            service = %controller.name(),
            ?notice,
            panic = %panic_message(&*panic),
            "lifecycle listener panicked"
        );
    }
}
