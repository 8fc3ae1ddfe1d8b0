//! Parent selection rule

/// Distance through a responder advertising `responder_distance`, if it
/// beats `current`
///
/// Only strict improvement counts, so among equal offers the first one
/// heard is kept.
pub fn improved_distance(current: u8, responder_distance: u8) -> Option<u8> {
    let candidate = responder_distance.saturating_add(1);
    (candidate < current).then_some(candidate)
}
