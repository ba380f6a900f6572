use crate::audio::UnitId;
use crate::session::TransportEvent;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};

/// Inbound server traffic buffered ahead of the session loop
pub const TRANSPORT_QUEUE: usize = 256;

/// Senders handed to the devices and the transport of one connection
pub struct ConnectionSenders {
    pub capture_tx: Sender<Vec<f32>>,
    pub completion_tx: UnboundedSender<UnitId>,
    pub transport_tx: Sender<TransportEvent>,
}

/// Receivers drained by the session loop for one connection.
///
/// Dropping them detaches every producer of that connection.
pub struct ConnectionReceivers {
    pub capture_rx: Receiver<Vec<f32>>,
    pub completion_rx: UnboundedReceiver<UnitId>,
    pub transport_rx: Receiver<TransportEvent>,
}

pub struct ConnectionChannels {
    pub senders: ConnectionSenders,
    pub receivers: ConnectionReceivers,
}

impl ConnectionChannels {
    pub fn new(capture_queue: usize) -> Self {
        let (capture_tx, capture_rx) = mpsc::channel(capture_queue.max(1));
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_QUEUE);

        Self {
            senders: ConnectionSenders {
                capture_tx,
                completion_tx,
                transport_tx,
            },
            receivers: ConnectionReceivers {
                capture_rx,
                completion_rx,
                transport_rx,
            },
        }
    }
}
