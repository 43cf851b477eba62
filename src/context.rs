//! Request Context
//!
//! Per-thread `{request_id, session_id, task_id}` triple used to tag log
//! output and to supply a default task for WAL appends. Setting a context
//! returns a guard; dropping the guard restores whatever was set before.

use std::cell::RefCell;

use tracing::span::EnteredSpan;

thread_local! {
    static CURRENT: RefCell<Option<RequestContext>> = const { RefCell::new(None) };
}

/// Identity of the request currently being served on this thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
}

impl RequestContext {
    /// New context with a random request id
    pub fn new() -> Self {
        Self::with_request_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            session_id: None,
            task_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the previous context when dropped
///
/// Tied to the thread that created it.
#[must_use = "the context is cleared as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<RequestContext>,
    _span: EnteredSpan,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Install `ctx` as this thread's request context
///
/// Log events emitted while the guard lives are recorded inside a
/// `request` span carrying the three identifiers.
pub fn set_request_context(ctx: RequestContext) -> ContextGuard {
    let span = tracing::info_span!(
        "request",
        request_id = %ctx.request_id,
        session_id = ctx.session_id.as_deref().unwrap_or(""),
        task_id = ctx.task_id.as_deref().unwrap_or(""),
    )
    .entered();

    let previous = CURRENT.with(|current| current.borrow_mut().replace(ctx));
    ContextGuard {
        previous,
        _span: span,
    }
}

/// Current request context, if any
pub fn get_request_context() -> Option<RequestContext> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Remove this thread's request context
///
/// Outstanding guards still restore their saved context when dropped.
pub fn clear_request_context() {
    CURRENT.with(|current| *current.borrow_mut() = None);
}

/// Task id of the current request context
pub fn current_task_id() -> Option<String> {
    CURRENT.with(|current| current.borrow().as_ref().and_then(|c| c.task_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_restore() {
        assert!(get_request_context().is_none());

        {
            let _guard = set_request_context(RequestContext::with_request_id("r1").with_task("t1"));
            let ctx = get_request_context().unwrap();
            assert_eq!(ctx.request_id, "r1");
            assert_eq!(current_task_id().as_deref(), Some("t1"));
        }

        assert!(get_request_context().is_none());
        assert!(current_task_id().is_none());
    }

    #[test]
    fn test_nested_contexts() {
        let _outer = set_request_context(RequestContext::with_request_id("outer").with_task("a"));
        {
            let _inner = set_request_context(
                RequestContext::with_request_id("inner")
                    .with_session("s1")
                    .with_task("b"),
            );
            assert_eq!(current_task_id().as_deref(), Some("b"));
            assert_eq!(
                get_request_context().unwrap().session_id.as_deref(),
                Some("s1")
            );
        }
        assert_eq!(current_task_id().as_deref(), Some("a"));
    }

    #[test]
    fn test_clear() {
        let _guard = set_request_context(RequestContext::new().with_task("t"));
        clear_request_context();
        assert!(get_request_context().is_none());
    }

    #[test]
    fn test_context_is_thread_local() {
        let _guard = set_request_context(RequestContext::new().with_task("main"));
        let seen = std::thread::spawn(current_task_id).join().unwrap();
        assert!(seen.is_none());
    }

    #[test]
    fn test_generated_request_ids_differ() {
        assert_ne!(RequestContext::new().request_id, RequestContext::new().request_id);
    }
}
