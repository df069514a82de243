use std::time::Duration;
use tagbridge_core::TagId;
use tokio::time::Instant;

/// Suppresses repeated reads of one tag within a window.
///
/// The window runs from the last *accepted* read, so a card held on a polled
/// reader yields one event per window rather than none at all.
///
/// ```
/// use std::time::Duration;
/// use tagbridge_core::TagId;
/// use tagbridge_session::Debouncer;
/// use tokio::time::Instant;
///
/// let mut debouncer = Debouncer::new(Duration::from_secs(1));
/// let tag = TagId::parse("04a1b2c3").unwrap();
/// let now = Instant::now();
///
/// assert!(debouncer.accept(&tag, now));
/// assert!(!debouncer.accept(&tag, now + Duration::from_millis(500)));
/// assert!(debouncer.accept(&tag, now + Duration::from_secs(1)));
/// ```
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: Option<(TagId, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns `true` if the read should be emitted.
    pub fn accept(&mut self, tag: &TagId, now: Instant) -> bool {
        if let Some((last_tag, at)) = &self.last
            && last_tag == tag
            && now.saturating_duration_since(*at) < self.window
        {
            return false;
        }
        self.last = Some((tag.clone(), now));
        true
    }

    /// Forget the last read.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
