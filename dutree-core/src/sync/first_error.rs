use crossbeam_channel::{bounded, Receiver, Sender};

/// Single-slot error box: the first error stored wins, later ones are
/// dropped without blocking the caller.
pub struct FirstError {
    tx: Sender<anyhow::Error>,
    rx: Receiver<anyhow::Error>,
}

impl Default for FirstError {
    fn default() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `err` unless an error is already held. Returns true if it was kept.
    pub fn set(&self, err: anyhow::Error) -> bool {
        match self.tx.try_send(err) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("dropping subsequent error: {:#}", e.into_inner());
                false
            }
        }
    }

    pub fn is_set(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn take(&self) -> Option<anyhow::Error> {
        self.rx.try_recv().ok()
    }

    /// `Err` with the stored error, if any.
    pub fn into_result(self) -> anyhow::Result<()> {
        match self.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
