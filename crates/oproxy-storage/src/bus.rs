use tokio::sync::watch;

/// Change-notification bus between the admin surface and the hot-path
/// caches. Carries no payload, only a generation counter; subscribers
/// reload the snapshot themselves.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: watch::Sender<u64>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Signal that provider/key/mapping records changed.
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_subscribers() {
        let bus = ChangeBus::new();
        let mut rx = bus.subscribe();
        bus.notify();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
    }
}
