//! Best-effort teardown helpers.
//!
//! Cleanup steps (cancel, dispose, unload) must never abort the teardown they
//! are part of. Each step runs under `guarded`, which turns both errors and
//! panics into a `false` return. Teardown driven from `Drop` passes
//! [`Teardown::Silent`] and never logs.

use std::any::Any;
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// How failures in a teardown step are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Log failures through `tracing`.
    Logged,
    /// Swallow failures (drop paths).
    Silent,
}

/// Run one teardown step, catching errors and panics.
///
/// Returns `true` if the step completed successfully.
pub fn guarded<E, F>(step: &str, subject: &str, mode: Teardown, f: F) -> bool
where
    E: Display,
    F: FnOnce() -> Result<(), E>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            if mode == Teardown::Logged {
                tracing::error!("{} failed for {}: {}", step, subject, e);
            }
            false
        }
        Err(payload) => {
            if mode == Teardown::Logged {
                tracing::error!(
                    "{} panicked for {}: {}",
                    step,
                    subject,
                    panic_message(payload.as_ref())
                );
            }
            false
        }
    }
}

/// Run an infallible teardown step, catching panics.
pub fn guarded_infallible(step: &str, subject: &str, mode: Teardown, f: impl FnOnce()) -> bool {
    guarded::<std::convert::Infallible, _>(step, subject, mode, || {
        f();
        Ok(())
    })
}

/// Render a panic payload as text.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_success() {
        assert!(guarded::<String, _>("dispose", "Foo", Teardown::Logged, || Ok(())));
    }

    #[test]
    fn test_guarded_error() {
        assert!(!guarded("dispose", "Foo", Teardown::Logged, || Err("boom")));
    }

    #[test]
    fn test_guarded_panic_is_contained() {
        let ok = guarded_infallible("unload", "Foo", Teardown::Silent, || panic!("boom"));
        assert!(!ok);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
