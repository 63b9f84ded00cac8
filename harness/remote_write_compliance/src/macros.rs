/// Record one graded check on a `validate::Scope`. The message is only
/// formatted when the check fails.
///
/// ```ignore
/// check!(scope, Must, "labels-sorted", labels.is_sorted(), "labels out of order: {names:?}");
/// ```
#[macro_export]
macro_rules! check {
    ($scope:expr, $level:ident, $name:expr, $cond:expr, $($arg:tt)+) => {{
        let passed: bool = $cond;
        let message = if passed {
            String::new()
        } else {
            format!($($arg)+)
        };
        $scope.record($crate::validate::Level::$level, $name, passed, message)
    }};
}
