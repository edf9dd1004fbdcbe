mod channel;

pub use channel::{Channel, ChannelError, Transport};
