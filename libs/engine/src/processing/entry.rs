//! Request entries carried by the ring

use crate::buffers::{Segment, SegmentToken};
use crate::session::SessionId;

/// What an entry asks the request processor to do, and what became of it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Submit the entry's segment, or the session's conflation segment when
    /// the entry carries none
    Send,
    /// Post the session's receive segment named by `receive_token`
    Receive,
    /// The session went away before the entry was processed
    ExpiredOperation,
    /// The segment's bytes were copied into another send of the same session
    AddedToBatch,
}

#[derive(Debug)]
pub struct RequestEntry {
    pub operation: Operation,
    pub session_id: SessionId,
    /// Session generation when the entry was published
    pub generation: u32,
    pub segment: Option<Segment>,
    pub receive_token: Option<SegmentToken>,
}

impl Default for RequestEntry {
    fn default() -> Self {
        Self {
            operation: Operation::ExpiredOperation,
            session_id: 0,
            generation: 0,
            segment: None,
            receive_token: None,
        }
    }
}

impl RequestEntry {
    pub fn send(session_id: SessionId, generation: u32, segment: Segment) -> Self {
        Self {
            operation: Operation::Send,
            session_id,
            generation,
            segment: Some(segment),
            receive_token: None,
        }
    }

    /// A send whose bytes sit in the session's conflation segment
    pub fn conflated_send(session_id: SessionId, generation: u32) -> Self {
        Self {
            operation: Operation::Send,
            session_id,
            generation,
            segment: None,
            receive_token: None,
        }
    }

    pub fn receive(session_id: SessionId, generation: u32, token: SegmentToken) -> Self {
        Self {
            operation: Operation::Receive,
            session_id,
            generation,
            segment: None,
            receive_token: Some(token),
        }
    }

    /// Bytes the entry carries, zero for receives and conflated sends
    pub fn byte_count(&self) -> usize {
        self.segment.as_ref().map_or(0, |segment| segment.len())
    }
}
