/// Panics unless `$expr` matches `$pat`. Used to check state machine invariants.
macro_rules! assert_match {
    ($pat:pat = $expr:expr) => ({
        if !matches!($expr, $pat) {
            panic!("invariant violated: `{}` does not match `{}`", stringify!($expr), stringify!($pat))
        }
    });
}

/// Per-message replication traces, noisier than anything logged at debug level elsewhere.
macro_rules! verbose {
    ($($arg:tt)*) => (
        log::trace!($($arg)*)
    );
}
