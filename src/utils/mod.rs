pub mod channels;

pub use channels::{ConnectionChannels, ConnectionReceivers, ConnectionSenders};
