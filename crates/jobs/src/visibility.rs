//! Page visibility signal.
//!
//! Polling is suspended entirely while the hosting page is hidden and resumes
//! with an immediate status check once it becomes visible again.
use tokio::sync::watch;

/// Owner side of the visibility signal, driven by the hosting page.
#[derive(Debug)]
pub struct PageVisibility {
    tx: watch::Sender<bool>,
}

impl PageVisibility {
    pub fn new(visible: bool) -> Self {
        let (tx, _rx) = watch::channel(visible);
        Self { tx }
    }

    pub fn set_visible(&self, visible: bool) {
        self.tx.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> VisibilityWatch {
        VisibilityWatch {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Default for PageVisibility {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Observer side of [`PageVisibility`]. A watch whose owner is gone reports
/// the page as permanently visible.
#[derive(Debug, Clone, Default)]
pub struct VisibilityWatch {
    rx: Option<watch::Receiver<bool>>,
}

impl VisibilityWatch {
    pub fn always_visible() -> Self {
        Self { rx: None }
    }

    pub fn is_visible(&self) -> bool {
        self.rx.as_ref().map_or(true, |rx| *rx.borrow())
    }

    /// Waits for the next visibility change and returns the new value.
    /// Never resolves for a watch that is always visible.
    pub async fn changed(&mut self) -> bool {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        match rx.changed().await {
            Ok(()) => *rx.borrow_and_update(),
            Err(_) => {
                self.rx = None;
                true
            }
        }
    }

    /// Resolves as soon as the page is visible.
    pub async fn wait_visible(&mut self) {
        while !self.is_visible() {
            self.changed().await;
        }
    }
}
