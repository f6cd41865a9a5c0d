//! Panic recovery utilities.
//!
//! A panicking rule or job handler must not take the worker down with it:
//! panics are captured, logged and converted into ordinary failures.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Execute a function with panic recovery.
///
/// If the function panics, the panic is captured, logged, and converted to
/// an error message tagged with `operation_name`.
///
/// # Example
/// ```
/// use jobkeeper::recovery::with_recovery;
///
/// let result: Result<u32, String> = with_recovery(|| Ok(1), "my_operation");
/// assert_eq!(result, Ok(1));
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T, String>
where
    F: FnOnce() -> Result<T, String>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                operation = operation_name,
                panic = %panic_msg,
                "panic_recovered"
            );

            Err(format!("panic in {}: {}", operation_name, panic_msg))
        }
    }
}

/// Extract panic message from panic payload.
pub(crate) fn extract_panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_and_err_pass_through() {
        assert_eq!(with_recovery(|| Ok::<_, String>(7), "rule:count"), Ok(7));
        assert_eq!(
            with_recovery(|| Err::<u8, _>("no match".to_string()), "rule:count"),
            Err("no match".to_string())
        );
    }

    #[test]
    fn test_panic_becomes_failure() {
        let items: Vec<u32> = Vec::new();
        let err = with_recovery(|| Ok(items[3]), "rule:first_item").unwrap_err();

        assert!(err.starts_with("panic in rule:first_item"));
        assert!(err.contains("index out of bounds"));
    }

    #[test]
    fn test_non_string_payload() {
        let payload = std::panic::catch_unwind(|| std::panic::panic_any(42_u64)).unwrap_err();
        assert_eq!(extract_panic_message(&payload), "unknown panic (no message)");

        let payload = std::panic::catch_unwind(|| panic!("job {} blew up", 9)).unwrap_err();
        assert_eq!(extract_panic_message(&payload), "job 9 blew up");
    }
}
