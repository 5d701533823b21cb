//! Assertion macros shared by integration tests.

/// Assert that a parsed frame is an error envelope with the given type and
/// code.
#[macro_export]
macro_rules! assert_error_frame {
    ($frame:expr, $kind:expr, $code:expr) => {{
        let frame = &$frame;
        assert_eq!(frame["type"], $kind, "unexpected frame {frame}");
        assert_eq!(frame["payload"]["code"], $code, "unexpected frame {frame}");
    }};
}
