use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::error::TransportError;

/// Outbound datagram sink. The dispatchers never touch sockets directly.
pub trait Transport {
    fn send(&mut self, addr: SocketAddr, datagram: Vec<u8>) -> Result<(), TransportError>;
}

/// In-memory transport that collects datagrams until drained. An optional
/// capacity makes it fail like a full socket queue.
#[derive(Debug, Default)]
pub struct Outbox {
    datagrams: VecDeque<(SocketAddr, Vec<u8>)>,
    capacity: Option<usize>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            datagrams: VecDeque::new(),
            capacity: Some(capacity),
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (SocketAddr, Vec<u8>)> + '_ {
        self.datagrams.drain(..)
    }

    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }
}

impl Transport for Outbox {
    fn send(&mut self, addr: SocketAddr, datagram: Vec<u8>) -> Result<(), TransportError> {
        if self.capacity.is_some_and(|cap| self.datagrams.len() >= cap) {
            return Err(TransportError::QueueFull(addr));
        }
        self.datagrams.push_back((addr, datagram));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_outbox_reports_full() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 9));
        let mut outbox = Outbox::bounded(1);
        assert!(outbox.send(addr, vec![1]).is_ok());
        assert_eq!(
            outbox.send(addr, vec![2]),
            Err(TransportError::QueueFull(addr))
        );
        assert_eq!(outbox.drain().count(), 1);
        assert!(outbox.send(addr, vec![3]).is_ok());
    }
}
