//! Outbound transport queue for the shared radio medium.
//!
//! Every frame bound for the field goes through one [`TransportQueue`].
//! Producers (the bridge and the polling scheduler) enqueue from any task;
//! the radio link is the only consumer and transmits one frame per
//! [`Pacer`] slot, so at most one exchange is ever in flight.
//!
//! High-priority frames (cloud writes) overtake normal frames (polling
//! reads) that are still waiting, and stay in arrival order among
//! themselves.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::frame::RequestFrame;

/// Transmission priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Routine polling.
    Normal,
    /// Cloud-originated writes.
    High,
}

/// An encoded request waiting for the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Field node the frame is addressed to.
    pub devaddr: String,
    /// Hex-encoded request.
    pub data: String,
    pub priority: Priority,
}

impl OutboundFrame {
    pub fn new(devaddr: impl Into<String>, frame: &RequestFrame, priority: Priority) -> Self {
        Self {
            devaddr: devaddr.into(),
            data: frame.encode_hex(),
            priority,
        }
    }
}

#[derive(Debug, Default)]
struct Lanes {
    urgent: VecDeque<OutboundFrame>,
    routine: VecDeque<OutboundFrame>,
}

/// Priority-ordered outbound queue.
#[derive(Debug, Default)]
pub struct TransportQueue {
    lanes: Mutex<Lanes>,
    ready: Notify,
}

impl TransportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame and wake the consumer.
    pub fn enqueue(&self, frame: OutboundFrame) {
        {
            let mut lanes = self.lanes.lock();
            match frame.priority {
                Priority::High => lanes.urgent.push_back(frame),
                Priority::Normal => lanes.routine.push_back(frame),
            }
        }
        self.ready.notify_one();
    }

    /// Take the next frame, if any.
    pub fn dequeue(&self) -> Option<OutboundFrame> {
        let mut lanes = self.lanes.lock();
        lanes
            .urgent
            .pop_front()
            .or_else(|| lanes.routine.pop_front())
    }

    /// Wait for the next frame.
    ///
    /// Cancel safe: a frame is only removed in the same poll that
    /// returns it.
    pub async fn next(&self) -> OutboundFrame {
        loop {
            if let Some(frame) = self.dequeue() {
                return frame;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.urgent.len() + lanes.routine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Enforces a quiet interval after every transmission.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    next_slot: Instant,
}

impl Pacer {
    /// A pacer whose first slot is open immediately.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Instant::now(),
        }
    }

    /// Wait until the medium is free.
    pub async fn ready(&self) {
        if Instant::now() < self.next_slot {
            tokio::time::sleep_until(self.next_slot).await;
        }
    }

    /// Record a transmission; the next slot opens one interval from now.
    pub fn sent(&mut self) {
        self.next_slot = Instant::now() + self.interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(tag: &str, priority: Priority) -> OutboundFrame {
        OutboundFrame {
            devaddr: "7076e841".to_string(),
            data: tag.to_string(),
            priority,
        }
    }

    fn drain(queue: &TransportQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.dequeue()).map(|f| f.data).collect()
    }

    #[test]
    fn test_priority_overtakes_waiting_reads() {
        let queue = TransportQueue::new();
        queue.enqueue(frame("r1", Priority::Normal));
        queue.enqueue(frame("r2", Priority::Normal));
        queue.enqueue(frame("w1", Priority::High));
        queue.enqueue(frame("r3", Priority::Normal));
        queue.enqueue(frame("w2", Priority::High));

        assert_eq!(queue.len(), 5);
        assert_eq!(drain(&queue), vec!["w1", "w2", "r1", "r2", "r3"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_already_sent_reads_are_not_reordered() {
        let queue = TransportQueue::new();
        queue.enqueue(frame("r1", Priority::Normal));
        assert_eq!(queue.dequeue().unwrap().data, "r1");

        queue.enqueue(frame("r2", Priority::Normal));
        queue.enqueue(frame("w1", Priority::High));
        assert_eq!(drain(&queue), vec!["w1", "r2"]);
    }

    #[test]
    fn test_concurrent_producers_keep_their_order() {
        let queue = Arc::new(TransportQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let priority = if p % 2 == 0 {
                            Priority::High
                        } else {
                            Priority::Normal
                        };
                        queue.enqueue(frame(&format!("{}:{}", p, i), priority));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let out: Vec<(usize, usize)> = drain(&queue)
            .iter()
            .map(|tag| {
                let (p, i) = tag.split_once(':').unwrap();
                (p.parse().unwrap(), i.parse().unwrap())
            })
            .collect();
        assert_eq!(out.len(), 200);

        // All urgent frames first.
        assert!(out[..100].iter().all(|(p, _)| p % 2 == 0));
        for p in 0..4 {
            let seq: Vec<usize> = out.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(seq, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_next_waits_for_enqueue() {
        let queue = Arc::new(TransportQueue::new());
        let mut next = tokio_test::task::spawn({
            let queue = queue.clone();
            async move { queue.next().await }
        });
        tokio_test::assert_pending!(next.poll());

        queue.enqueue(frame("w1", Priority::High));
        assert!(next.is_woken());
        let got = tokio_test::assert_ready!(next.poll());
        assert_eq!(got.data, "w1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_spaces_transmissions() {
        let mut pacer = Pacer::new(Duration::from_millis(3500));
        let start = Instant::now();

        pacer.ready().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        pacer.sent();

        pacer.ready().await;
        assert!(start.elapsed() >= Duration::from_millis(3500));
        assert!(start.elapsed() < Duration::from_millis(3600));
        pacer.sent();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let before = Instant::now();
        pacer.ready().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_outbound_frame_is_hex_encoded() {
        let out = OutboundFrame::new("7076e841", &RequestFrame::read(1, 0, 10), Priority::Normal);
        assert_eq!(out.data, "01030000000AC5CD");
    }
}
