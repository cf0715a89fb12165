/// Which instance state and command operations target.
///
/// `remembered` is the last choice made in this or a previous process. It is
/// reported to callers as a hint and never selects anything by itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    current: Option<String>,
    remembered: Option<String>,
}

impl Selection {
    pub fn with_preference(remembered: Option<String>) -> Self {
        Self {
            current: None,
            remembered: remembered.filter(|id| !id.is_empty()),
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn remembered(&self) -> Option<&str> {
        self.remembered.as_deref()
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.current.as_deref() == Some(id)
    }

    pub fn select(&mut self, id: &str) {
        self.current = Some(id.to_string());
        self.remembered = Some(id.to_string());
    }

    /// Applied after `id` registered and `live` instances are connected.
    /// Selects `id` only when it is the sole live instance and nothing is
    /// selected yet.
    pub fn on_register(&mut self, id: &str, live: usize) -> bool {
        if self.current.is_some() || live != 1 {
            return false;
        }
        self.select(id);
        true
    }

    /// Clears the selection if it points at `id`. The remembered choice stays.
    pub fn clear_if(&mut self, id: &str) -> bool {
        if self.is_selected(id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}
