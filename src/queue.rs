use crossbeam_channel::{Receiver, Sender};

use crate::media::{StatusSnapshot, Verb};

/// One unit of work for the scrobbler thread.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryItem {
    pub verb: Verb,
    pub snapshot: StatusSnapshot,
}

impl DeliveryItem {
    pub fn new(verb: Verb, snapshot: StatusSnapshot) -> Self {
        Self { verb, snapshot }
    }

    /// Item whose verb follows the snapshot's playback state.
    pub fn for_state(snapshot: StatusSnapshot) -> Self {
        Self::new(snapshot.state.verb(), snapshot)
    }
}

pub type DeliverySender = Sender<DeliveryItem>;
pub type DeliveryReceiver = Receiver<DeliveryItem>;

/// Unbounded FIFO shared by every source; closes once all senders drop.
pub fn delivery_queue() -> (DeliverySender, DeliveryReceiver) {
    crossbeam_channel::unbounded()
}
