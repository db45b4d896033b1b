//! Unsubscribe handles

use std::fmt;

/// Undoes a registration made by a `listen`/`add_listener` style call.
///
/// Removal is explicit: dropping the handle leaves the registration in place,
/// so callers that want a listener for their whole lifetime can simply keep
/// or forget the handle.
#[must_use = "dropping a RemoveListener leaves the listener registered"]
pub struct RemoveListener(Option<Box<dyn FnOnce() + Send>>);

impl RemoveListener {
    /// Wrap the closure that performs the removal
    pub fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(remove)))
    }

    /// A handle that removes nothing
    pub fn noop() -> Self {
        Self(None)
    }

    /// Remove the registration
    pub fn remove(mut self) {
        if let Some(remove) = self.0.take() {
            remove();
        }
    }
}

impl fmt::Debug for RemoveListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoveListener")
            .field("armed", &self.0.is_some())
            .finish()
    }
}
