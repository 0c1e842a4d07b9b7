//! Multi-producer single-consumer request ring
//!
//! Producers claim a sequence with a CAS on the claim cursor, fill the slot in
//! place and publish it by storing `sequence + 1` into the slot. The consumer
//! walks forward from its cursor while slots are published, hands each entry to
//! its handler with an end-of-batch flag on the last contiguous one, then moves
//! its cursor past the batch to hand the slots back to producers.
//!
//! A claim that is dropped without an explicit publish still publishes an
//! expired entry so the consumer never stalls behind it.

use super::entry::{Operation, RequestEntry};
use crate::{EngineError, Result};
use engine_config::{ProducerPolicy, RingConfig};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[repr(align(64))]
struct PaddedCursor(AtomicU64);

struct Slot {
    /// `sequence + 1` of the entry last published here
    published: AtomicU64,
    entry: UnsafeCell<RequestEntry>,
}

pub struct RequestRing {
    mask: u64,
    capacity: u64,
    slots: Box<[Slot]>,
    claim: PaddedCursor,
    consumed: PaddedCursor,
    policy: ProducerPolicy,
    claim_timeout: Duration,
}

// SAFETY: a slot's entry is written only by the producer holding its claim and
// read only by the consumer after the publish store, with the consumer cursor
// handing slots back before producers can claim them again.
unsafe impl Sync for RequestRing {}

impl RequestRing {
    /// Create a ring and its single consumer
    pub fn new(config: &RingConfig) -> Result<(Arc<Self>, RingConsumer)> {
        if !config.capacity.is_power_of_two() {
            return Err(EngineError::configuration(
                format!("ring capacity {} is not a power of two", config.capacity),
                Some("ring.capacity"),
            ));
        }
        let slots = (0..config.capacity)
            .map(|_| Slot {
                published: AtomicU64::new(0),
                entry: UnsafeCell::new(RequestEntry::default()),
            })
            .collect();

        let ring = Arc::new(Self {
            mask: config.capacity as u64 - 1,
            capacity: config.capacity as u64,
            slots,
            claim: PaddedCursor(AtomicU64::new(0)),
            consumed: PaddedCursor(AtomicU64::new(0)),
            policy: config.producer_policy,
            claim_timeout: config.claim_timeout(),
        });
        let consumer = RingConsumer {
            ring: ring.clone(),
            next: 0,
        };
        Ok((ring, consumer))
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Entries claimed but not yet consumed
    pub fn len(&self) -> usize {
        let claimed = self.claim.0.load(Ordering::Acquire);
        let consumed = self.consumed.0.load(Ordering::Acquire);
        claimed.saturating_sub(consumed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(&self, sequence: u64) -> &Slot {
        &self.slots[(sequence & self.mask) as usize]
    }

    /// Claim the next slot according to the configured producer policy
    pub fn claim(&self) -> Result<Claim<'_>> {
        let mut deadline: Option<Instant> = None;
        loop {
            // Consumed first: a claim read afterwards can never trail it
            let consumed = self.consumed.0.load(Ordering::Acquire);
            let sequence = self.claim.0.load(Ordering::Acquire);

            if sequence.wrapping_sub(consumed) >= self.capacity {
                if self.consumed.0.load(Ordering::Acquire) != consumed {
                    continue;
                }
                match self.policy {
                    ProducerPolicy::NonBlocking => {
                        return Err(EngineError::backpressure("request_ring", "ring is full"))
                    }
                    ProducerPolicy::Blocking => {
                        let deadline =
                            *deadline.get_or_insert_with(|| Instant::now() + self.claim_timeout);
                        if Instant::now() >= deadline {
                            return Err(EngineError::timeout(
                                "request ring claim",
                                self.claim_timeout.as_millis() as u64,
                            ));
                        }
                        std::hint::spin_loop();
                        std::thread::yield_now();
                        continue;
                    }
                }
            }

            if self
                .claim
                .0
                .compare_exchange_weak(sequence, sequence + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(Claim {
                    ring: self,
                    sequence,
                    published: false,
                });
            }
        }
    }

    /// Claim a slot, store `entry` in it and publish
    pub fn publish(&self, entry: RequestEntry) -> Result<()> {
        let mut claim = self.claim()?;
        *claim = entry;
        claim.publish();
        Ok(())
    }
}

/// Exclusive access to a claimed slot until it is published
pub struct Claim<'a> {
    ring: &'a RequestRing,
    sequence: u64,
    published: bool,
}

impl Claim<'_> {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Make the entry visible to the consumer
    pub fn publish(mut self) {
        self.mark_published();
    }

    fn mark_published(&mut self) {
        self.published = true;
        self.ring
            .slot(self.sequence)
            .published
            .store(self.sequence + 1, Ordering::Release);
    }
}

impl Deref for Claim<'_> {
    type Target = RequestEntry;

    fn deref(&self) -> &RequestEntry {
        // SAFETY: the claim is the only writer of this slot until published.
        unsafe { &*self.ring.slot(self.sequence).entry.get() }
    }
}

impl DerefMut for Claim<'_> {
    fn deref_mut(&mut self) -> &mut RequestEntry {
        // SAFETY: as in `deref`.
        unsafe { &mut *self.ring.slot(self.sequence).entry.get() }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.published {
            let entry = &mut **self;
            entry.operation = Operation::ExpiredOperation;
            self.mark_published();
        }
    }
}

/// The ring's only consumer
pub struct RingConsumer {
    ring: Arc<RequestRing>,
    next: u64,
}

impl RingConsumer {
    pub fn ring(&self) -> &Arc<RequestRing> {
        &self.ring
    }

    /// Hand every published entry, up to `max`, to `handler`. The second
    /// argument is true for the last entry of the batch. Returns the number
    /// of entries consumed.
    pub fn drain<F>(&mut self, max: usize, mut handler: F) -> usize
    where
        F: FnMut(&mut RequestEntry, bool),
    {
        let start = self.next;
        let mut end = start;
        while end - start < max as u64
            && self.ring.slot(end).published.load(Ordering::Acquire) == end + 1
        {
            end += 1;
        }
        if end == start {
            return 0;
        }

        for sequence in start..end {
            // SAFETY: published slots between our cursor and `end` belong to
            // the consumer until the cursor store below.
            let entry = unsafe { &mut *self.ring.slot(sequence).entry.get() };
            handler(entry, sequence + 1 == end);
        }

        self.next = end;
        self.ring.consumed.0.store(end, Ordering::Release);
        (end - start) as usize
    }
}
