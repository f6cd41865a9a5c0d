//! Log output of panic recovery. Kept in its own test binary because
//! `traced_test` installs a global subscriber.

use jobkeeper::recovery::with_recovery;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_recovered_panic_is_logged() {
    let err = with_recovery(|| -> Result<(), String> { panic!("rule exploded") }, "rule:explode").unwrap_err();

    assert!(err.contains("rule exploded"));
    assert!(logs_contain("panic_recovered"));
    assert!(logs_contain("rule:explode"));
}
