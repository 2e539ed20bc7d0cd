/// Outbound data tunnels
///
/// A tunnel delivers envelopes to one receiving minor fragment. The exchange
/// only needs `send`; `ChannelTunnel` is the in-process implementation used
/// when sender and receiver fragments share a process.
use crate::distributed::message::FragmentWritableBatch;
use crate::error::{EngineError, EngineResult};
use crossbeam::channel::{self, Receiver, Sender};

pub trait DataTunnel: Send + Sync {
    fn send(&self, batch: FragmentWritableBatch) -> EngineResult<()>;
}

#[derive(Debug, Clone)]
pub struct ChannelTunnel {
    sender: Sender<FragmentWritableBatch>,
}

impl ChannelTunnel {
    pub fn unbounded() -> (Self, Receiver<FragmentWritableBatch>) {
        let (sender, receiver) = channel::unbounded();
        (Self { sender }, receiver)
    }

    /// Tunnel whose `send` blocks once `capacity` envelopes are in flight
    pub fn bounded(capacity: usize) -> (Self, Receiver<FragmentWritableBatch>) {
        let (sender, receiver) = channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl DataTunnel for ChannelTunnel {
    fn send(&self, batch: FragmentWritableBatch) -> EngineResult<()> {
        let receivers = batch.receiving_minor_fragment_ids.clone();
        self.sender.send(batch).map_err(|_| {
            EngineError::io(format!(
                "receiver {:?} disconnected before the batch was delivered",
                receivers
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::message::ExchangeRoute;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;
    use uuid::Uuid;

    fn route() -> ExchangeRoute {
        ExchangeRoute {
            query_id: Uuid::new_v4(),
            sending_major_fragment_id: 1,
            sending_minor_fragment_id: 0,
            receiving_major_fragment_id: 2,
        }
    }

    #[test]
    fn test_send_and_receive() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        let (tunnel, rx) = ChannelTunnel::unbounded();
        tunnel
            .send(FragmentWritableBatch::empty(true, route(), 3, schema))
            .unwrap();
        let got = rx.recv().unwrap();
        assert!(got.is_last_batch);
        assert_eq!(got.receiving_minor_fragment_ids, vec![3]);
        assert_eq!(got.row_count, 0);
    }

    #[test]
    fn test_disconnected_receiver_is_io_error() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        let (tunnel, rx) = ChannelTunnel::bounded(1);
        drop(rx);
        let err = tunnel
            .send(FragmentWritableBatch::empty(false, route(), 0, schema))
            .unwrap_err();
        assert!(matches!(err, EngineError::IO { .. }));
    }
}
