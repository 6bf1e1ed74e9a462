//! Unit tests for the dependency-recovery retry policy.

use webtty::runner::retry::{
    match_missing_module, package_for, RetryContext, MAX_ATTEMPTS,
};

/// The missing-module pattern is extracted from a realistic traceback.
#[test]
fn missing_module_extracted_from_traceback() {
    let stderr = concat!(
        "Traceback (most recent call last):\n",
        "  File \"main.py\", line 1, in <module>\n",
        "    import cv2\n",
        "ModuleNotFoundError: No module named 'cv2'\n",
    );
    assert_eq!(match_missing_module(stderr).as_deref(), Some("cv2"));
}

/// Unrelated stderr yields no module.
#[test]
fn unrelated_stderr_matches_nothing() {
    assert_eq!(match_missing_module("SyntaxError: invalid syntax\n"), None);
    assert_eq!(match_missing_module(""), None);
}

/// Dotted module names are captured whole.
#[test]
fn dotted_module_name_is_captured() {
    let stderr = "ModuleNotFoundError: No module named 'PIL.Image'\n";
    assert_eq!(match_missing_module(stderr).as_deref(), Some("PIL.Image"));
}

/// Known import names map to their pip package names.
#[test]
fn known_imports_map_to_packages() {
    assert_eq!(package_for("cv2"), "opencv-python");
    assert_eq!(package_for("PIL"), "Pillow");
    assert_eq!(package_for("sklearn"), "scikit-learn");
    assert_eq!(package_for("bs4"), "beautifulsoup4");
    assert_eq!(package_for("qrcode"), "qrcode[pil]");
}

/// Unknown imports install under their own name.
#[test]
fn unknown_import_passes_through() {
    assert_eq!(package_for("requests"), "requests");
}

/// The retry budget is exactly one install-and-rerun cycle.
#[test]
fn budget_is_one_attempt() {
    assert_eq!(MAX_ATTEMPTS, 1);

    let mut ctx = RetryContext::new();
    assert!(!ctx.exhausted(), "fresh context must have budget");
    ctx.record_attempt();
    assert!(ctx.exhausted(), "one attempt must spend the budget");
}
