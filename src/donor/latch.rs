//! Single-assignment latches carrying coordinator notifications into a
//! running donor instance.

use tokio::sync::watch;

/// Category of coordinator notification a latch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatchCategory {
    RecipientsDoneCloning,
    StartBlockingWrites,
    Committing,
    Aborting,
}

impl std::fmt::Display for LatchCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatchCategory::RecipientsDoneCloning => write!(f, "recipientsDoneCloning"),
            LatchCategory::StartBlockingWrites => write!(f, "startBlockingWrites"),
            LatchCategory::Committing => write!(f, "committing"),
            LatchCategory::Aborting => write!(f, "aborting"),
        }
    }
}

/// A signal that fires at most once. Waiters that arrive after the fire
/// return immediately.
#[derive(Debug)]
pub struct EventLatch {
    category: LatchCategory,
    fired: watch::Sender<bool>,
}

impl EventLatch {
    pub fn new(category: LatchCategory) -> Self {
        Self {
            category,
            fired: watch::channel(false).0,
        }
    }

    pub fn category(&self) -> LatchCategory {
        self.category
    }

    /// Fire the latch. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.fired.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.borrow()
    }

    /// Wait until the latch fires.
    pub async fn wait(&self) {
        let mut rx = self.fired.subscribe();
        // `self` owns the sender, so the channel cannot close under us.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// The four latches one donor instance listens on.
#[derive(Debug)]
pub struct DonorLatches {
    pub recipients_done_cloning: EventLatch,
    pub start_blocking_writes: EventLatch,
    pub committing: EventLatch,
    pub aborting: EventLatch,
}

impl DonorLatches {
    pub fn new() -> Self {
        Self {
            recipients_done_cloning: EventLatch::new(LatchCategory::RecipientsDoneCloning),
            start_blocking_writes: EventLatch::new(LatchCategory::StartBlockingWrites),
            committing: EventLatch::new(LatchCategory::Committing),
            aborting: EventLatch::new(LatchCategory::Aborting),
        }
    }

    pub fn get(&self, category: LatchCategory) -> &EventLatch {
        match category {
            LatchCategory::RecipientsDoneCloning => &self.recipients_done_cloning,
            LatchCategory::StartBlockingWrites => &self.start_blocking_writes,
            LatchCategory::Committing => &self.committing,
            LatchCategory::Aborting => &self.aborting,
        }
    }
}

impl Default for DonorLatches {
    fn default() -> Self {
        Self::new()
    }
}
