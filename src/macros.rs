// (c) Copyright 2025 Helsing GmbH. All rights reserved.
/// Convenience macro for creating a [`Path`](crate::Path) from its segments.
///
/// Each segment may be anything that implements [`Display`](std::fmt::Display). Segments are
/// taken verbatim, so unlike [`Path::parse`](crate::Path::parse) a segment may contain `/`.
///
/// ```rust
/// # use patchsync::{Path, path};
/// let id = 42;
/// assert_eq!(path!("planet", id, "name"), Path::parse("/planet/42/name"));
/// assert_eq!(path!("planet", "moons", "-").to_string(), "/planet/moons/-");
/// assert!(path!().is_root());
/// ```
#[macro_export]
macro_rules! path {
    () => {
        $crate::Path::root()
    };
    ($($segment:expr),+ $(,)?) => {
        <$crate::Path as ::std::iter::FromIterator<::std::string::String>>::from_iter([
            $(::std::string::ToString::to_string(&$segment)),+
        ])
    };
}

/// Convenience macro for creating an [`Operation`](crate::Operation) from its wire shape.
///
/// The value, where there is one, is given as [`serde_json::json!`] input.
///
/// ```rust
/// # use patchsync::{Operation, op, path};
/// # use serde_json::json;
/// assert_eq!(
///     op!(add "/planet/p1" => {"name": "Mercury"}),
///     Operation::add(path!("planet", "p1"), json!({"name": "Mercury"})),
/// );
/// assert_eq!(op!(remove "/planet/p1"), Operation::remove(path!("planet", "p1")));
/// assert_eq!(
///     op!(move "/planet/p1" => "/planet/p2"),
///     Operation::move_to(path!("planet", "p1"), path!("planet", "p2")),
/// );
/// ```
#[macro_export]
macro_rules! op {
    (add $path:expr => $($value:tt)+) => {
        $crate::Operation::add($crate::Path::parse($path), $crate::serde_json::json!($($value)+))
    };
    (replace $path:expr => $($value:tt)+) => {
        $crate::Operation::replace($crate::Path::parse($path), $crate::serde_json::json!($($value)+))
    };
    (test $path:expr => $($value:tt)+) => {
        $crate::Operation::test($crate::Path::parse($path), $crate::serde_json::json!($($value)+))
    };
    (remove $path:expr) => {
        $crate::Operation::remove($crate::Path::parse($path))
    };
    (move $from:expr => $path:expr) => {
        $crate::Operation::move_to($crate::Path::parse($from), $crate::Path::parse($path))
    };
    (copy $from:expr => $path:expr) => {
        $crate::Operation::copy_to($crate::Path::parse($from), $crate::Path::parse($path))
    };
}
