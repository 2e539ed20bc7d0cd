/// Hash exchange: the sending side of a hash-partitioned data exchange
/// between fragments
pub mod decorator;
pub mod message;
pub mod outgoing;
pub mod partitioner;
pub mod receivers;
pub mod sender;
pub mod sizing;
pub mod tunnel;

pub use decorator::PartitionerDecorator;
pub use message::{ExchangeRoute, FragmentWritableBatch};
pub use outgoing::PartitionOutgoingBatch;
pub use partitioner::HashPartitioner;
pub use receivers::{Destination, ReceiverStatus};
pub use sender::{ExchangeMetric, HashExchangeSender};
pub use sizing::{actual_sender_threads, desired_sender_threads, slice_ranges};
pub use tunnel::{ChannelTunnel, DataTunnel};
