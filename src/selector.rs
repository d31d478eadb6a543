//! Advertised-name matching used by the scan phase.

/// `true` when `advertised` starts with `prefix`, ignoring ASCII case.
///
/// An empty prefix never matches, so a blank configuration cannot make the
/// scan latch onto whichever peripheral advertises first.
///
/// ```
/// # use ble_capture::selector::matches;
/// assert!(matches("BrainLink-01", "brain"));
/// assert!(!matches("xBrain", "brain"));
/// ```
pub fn matches(advertised: &str, prefix: &str) -> bool {
    if prefix.is_empty() || prefix.len() > advertised.len() {
        return false;
    }
    advertised
        .as_bytes()
        .iter()
        .zip(prefix.as_bytes())
        .all(|(a, p)| a.eq_ignore_ascii_case(p))
}
