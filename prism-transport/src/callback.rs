//! Isolation of user callbacks.
//!
//! A panicking callback must not take the queue or the reader task down
//! with it. Every user-supplied closure runs through [`guarded`], which
//! turns a panic into a [`CallbackPanic`] for the configured handler.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A user callback panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPanic {
    /// Which kind of callback failed.
    pub context: &'static str,
    pub message: String,
}

impl fmt::Display for CallbackPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} callback panicked: {}", self.context, self.message)
    }
}

pub type CallbackErrorHandler = Arc<dyn Fn(&CallbackPanic) + Send + Sync>;

/// Logs the panic and carries on.
pub fn log_callback_errors() -> CallbackErrorHandler {
    Arc::new(|panic: &CallbackPanic| log::error!("{panic}"))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `f`, reporting a panic to `handler`. Returns false if `f` panicked.
pub fn guarded<F: FnOnce()>(context: &'static str, handler: &CallbackErrorHandler, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let panic = CallbackPanic {
                context,
                message: panic_message(payload.as_ref()),
            };
            // A panicking handler is only logged.
            if catch_unwind(AssertUnwindSafe(|| handler(&panic))).is_err() {
                log::error!("callback error handler panicked while reporting: {panic}");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_guarded_reports_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: CallbackErrorHandler = Arc::new(move |p: &CallbackPanic| {
            sink.lock().unwrap().push(p.clone());
        });

        assert!(guarded("response", &handler, || {}));
        assert!(!guarded("response", &handler, || panic!("boom")));
        assert!(!guarded("image", &handler, || panic!("{} frames", 3)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].message, "boom");
        assert_eq!(seen[1].context, "image");
        assert_eq!(seen[1].message, "3 frames");
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let handler: CallbackErrorHandler = Arc::new(|_: &CallbackPanic| panic!("handler"));
        assert!(!guarded("response", &handler, || panic!("callback")));
    }
}
