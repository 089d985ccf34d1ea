//! Retransmission Module Tests
//!
//! ## Test Scopes
//! - **Retransmitter**: Range tracking, contiguous runs, backoff and cancellation.
//! - **NakReceiverWindow**: Gap detection, in-order delivery, duplicates and stability.
//! - **AckSenderWindow / AckReceiverWindow**: Ack bookkeeping, throttling and reordering.

#[cfg(test)]
mod tests {
    use crate::message::{Address, Message, Seqno};
    use crate::retransmission::{
        AckReceiverWindow, AckSenderWindow, NakReceiverWindow, ResendFn, RetransmitCommand,
        Retransmitter,
    };
    use crate::scheduler::TimeScheduler;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn msg(seqno: Seqno) -> Message {
        Message::new(None, Some(addr(1)), seqno.to_le_bytes().to_vec())
    }

    fn seqno_of(msg: &Message) -> Seqno {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&msg.payload[..8]);
        Seqno::from_le_bytes(bytes)
    }

    #[derive(Default)]
    struct RecordingCommand {
        calls: Mutex<Vec<(Seqno, Seqno, Address)>>,
    }

    impl RetransmitCommand for RecordingCommand {
        fn retransmit(&self, first: Seqno, last: Seqno, sender: Address) {
            self.calls.lock().unwrap().push((first, last, sender));
        }
    }

    fn retransmitter(command: Arc<RecordingCommand>, intervals: &[u64]) -> Retransmitter {
        Retransmitter::new(
            addr(1),
            command,
            TimeScheduler::new(),
            intervals.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        )
    }

    // ============================================================
    // TEST 1: Retransmitter
    // ============================================================

    #[tokio::test]
    async fn test_retransmitter_fires_for_missing_range() {
        // ARRANGE
        let command = Arc::new(RecordingCommand::default());
        let xmit = retransmitter(command.clone(), &[30]);

        // ACT
        xmit.add(3, 5);
        tokio::time::sleep(Duration::from_millis(80)).await;

        // ASSERT
        let calls = command.calls.lock().unwrap().clone();
        assert!(!calls.is_empty());
        assert_eq!(calls[0], (3, 5, addr(1)));
        assert_eq!(xmit.size(), 3);
    }

    #[tokio::test]
    async fn test_retransmitter_splits_into_contiguous_runs() {
        let command = Arc::new(RecordingCommand::default());
        let xmit = retransmitter(command.clone(), &[40]);

        xmit.add(1, 5);
        assert!(xmit.remove(3));
        tokio::time::sleep(Duration::from_millis(70)).await;

        let calls = command.calls.lock().unwrap().clone();
        assert_eq!(calls[..2], [(1, 2, addr(1)), (4, 5, addr(1))]);
    }

    #[test]
    fn test_retransmitter_tracks_huge_range_without_expanding_it() {
        // ARRANGE
        let command = Arc::new(RecordingCommand::default());
        let xmit = retransmitter(command, &[1_000]);

        // ACT
        xmit.add(0, 999_999_999_999);
        assert!(xmit.remove(0));
        assert!(xmit.remove(500));
        assert!(xmit.remove(999_999_999_999));

        // ASSERT
        assert_eq!(xmit.size(), 999_999_999_997);
        assert!(!xmit.remove(500), "already removed");
        assert!(xmit.remove(501));
        xmit.reset();
        assert_eq!(xmit.size(), 0);
    }

    #[tokio::test]
    async fn test_retransmitter_stops_when_everything_arrived() {
        // ARRANGE
        let command = Arc::new(RecordingCommand::default());
        let xmit = retransmitter(command.clone(), &[30]);
        xmit.add(10, 11);

        // ACT: Both seqnos show up before the first timeout
        assert!(xmit.remove(10));
        assert!(xmit.remove(11));
        assert!(!xmit.remove(11), "already removed");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // ASSERT
        assert!(command.calls.lock().unwrap().is_empty());
        assert_eq!(xmit.size(), 0);
    }

    #[tokio::test]
    async fn test_retransmitter_backs_off() {
        // ARRANGE: 20ms, then 200ms forever
        let command = Arc::new(RecordingCommand::default());
        let xmit = retransmitter(command.clone(), &[20, 200]);

        // ACT
        xmit.add(1, 1);
        tokio::time::sleep(Duration::from_millis(150)).await;

        // ASSERT: Only the first attempt happened so far
        assert_eq!(command.calls.lock().unwrap().len(), 1);
        xmit.reset();
    }

    #[tokio::test]
    async fn test_retransmitter_reset_cancels_all() {
        let command = Arc::new(RecordingCommand::default());
        let xmit = retransmitter(command.clone(), &[30]);

        xmit.add(1, 3);
        xmit.add(7, 7);
        xmit.reset();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(command.calls.lock().unwrap().is_empty());
        assert_eq!(xmit.size(), 0);
    }

    #[test]
    fn test_retransmitter_ignores_empty_range() {
        let command = Arc::new(RecordingCommand::default());
        let xmit = retransmitter(command, &[30]);

        xmit.add(5, 4);

        assert_eq!(xmit.size(), 0);
    }

    // ============================================================
    // TEST 2: NakReceiverWindow
    // ============================================================

    #[test]
    fn test_nak_window_delivers_in_order() {
        let mut win = NakReceiverWindow::new(addr(1), 0, None);

        assert!(win.add(0, msg(0)));
        assert!(win.add(1, msg(1)));

        assert_eq!(win.remove().map(|m| seqno_of(&m)), Some(0));
        assert_eq!(win.remove().map(|m| seqno_of(&m)), Some(1));
        assert!(win.remove().is_none());
        assert_eq!(win.highest_delivered(), 1);
    }

    #[test]
    fn test_nak_window_holds_back_after_gap() {
        // ARRANGE
        let mut win = NakReceiverWindow::new(addr(1), 0, None);

        // ACT: 0, then 3 (1 and 2 missing)
        win.add(0, msg(0));
        win.add(3, msg(3));

        // ASSERT
        assert_eq!(win.missing(), vec![(1, 2)]);
        assert_eq!(win.highest_received(), 3);
        assert_eq!(win.highest_deliverable(), 0);

        assert_eq!(win.remove().map(|m| seqno_of(&m)), Some(0));
        assert!(win.remove().is_none(), "head #1 is missing");

        // ACT: Fill the gap out of order
        assert!(win.add(2, msg(2)));
        assert!(win.remove().is_none());
        assert!(win.add(1, msg(1)));

        // ASSERT: Everything flows now
        let delivered: Vec<Seqno> = std::iter::from_fn(|| win.remove())
            .map(|m| seqno_of(&m))
            .collect();
        assert_eq!(delivered, vec![1, 2, 3]);
        assert!(win.missing().is_empty());
    }

    #[test]
    fn test_nak_window_far_ahead_seqno_keeps_gap_as_one_range() {
        // ARRANGE
        let mut win = NakReceiverWindow::new(addr(1), 0, None);
        let far = 1_000_000_000;

        // ACT
        assert!(win.add(far, msg(far)));
        assert!(win.add(0, msg(0)));
        assert!(win.add(7, msg(7)));

        // ASSERT: Only the messages themselves are stored
        assert_eq!(win.missing(), vec![(1, 6), (8, far - 1)]);
        assert_eq!(win.size(), (far + 1) as usize);
        assert_eq!(win.remove().map(|m| seqno_of(&m)), Some(0));
        assert!(win.remove().is_none());
        assert_eq!(win.highest_received(), far);
    }

    #[test]
    fn test_nak_window_rejects_duplicates_and_old() {
        let mut win = NakReceiverWindow::new(addr(1), 5, None);

        assert!(!win.add(4, msg(4)), "below the start seqno");
        assert!(win.add(5, msg(5)));
        assert!(!win.add(5, msg(5)), "duplicate before delivery");

        win.remove();
        assert!(!win.add(5, msg(5)), "duplicate after delivery");
        assert_eq!(win.delivered_count(), 1);
    }

    #[test]
    fn test_nak_window_stable_discards_delivered() {
        // ARRANGE
        let mut win = NakReceiverWindow::new(addr(1), 0, None);
        for seqno in 0..5 {
            win.add(seqno, msg(seqno));
            win.remove();
        }
        assert_eq!(win.lowest_seen(), 0);

        // ACT
        win.stable(2);

        // ASSERT
        assert_eq!(win.delivered_count(), 2);
        assert_eq!(win.lowest_seen(), 3);
    }

    #[test]
    fn test_nak_window_empty_digest_values() {
        let win = NakReceiverWindow::new(addr(1), 0, None);

        assert_eq!(win.lowest_seen(), 0);
        assert_eq!(win.highest_delivered(), -1);
        assert_eq!(win.highest_deliverable(), -1);
        assert_eq!(win.highest_received(), -1);
    }

    #[tokio::test]
    async fn test_nak_window_requests_gap_until_filled() {
        // ARRANGE
        let command = Arc::new(RecordingCommand::default());
        let mut win = NakReceiverWindow::new(addr(1), 0, Some(retransmitter(command.clone(), &[30])));

        // ACT: Gap [1 - 2]
        win.add(0, msg(0));
        win.add(3, msg(3));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // ASSERT: Retransmission requested
        assert!(command.calls.lock().unwrap().contains(&(1, 2, addr(1))));

        // ACT: Fill the gap, then wait past more timeouts
        win.add(1, msg(1));
        win.add(2, msg(2));
        command.calls.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // ASSERT: No further requests
        assert!(command.calls.lock().unwrap().is_empty());
    }

    // ============================================================
    // TEST 3: Ack windows
    // ============================================================

    fn recording_resend() -> (ResendFn, Arc<Mutex<Vec<Seqno>>>) {
        let resent = Arc::new(Mutex::new(Vec::new()));
        let sink = resent.clone();
        let resend: ResendFn = Arc::new(move |seqno, _msg| sink.lock().unwrap().push(seqno));
        (resend, resent)
    }

    #[tokio::test]
    async fn test_ack_sender_window_resends_until_acked() {
        // ARRANGE
        let (resend, resent) = recording_resend();
        let win = AckSenderWindow::new(
            addr(2),
            resend,
            TimeScheduler::new(),
            vec![Duration::from_millis(30)],
            0,
            0,
        );

        // ACT
        assert!(win.add(1, msg(1)));
        assert!(win.add(2, msg(2)));
        win.ack(1);
        tokio::time::sleep(Duration::from_millis(60)).await;

        // ASSERT: Only the unacked message is resent
        let resent_now = resent.lock().unwrap().clone();
        assert!(resent_now.contains(&2));
        assert!(!resent_now.contains(&1));
        assert_eq!(win.size(), 1);

        win.ack(2);
        assert_eq!(win.size(), 0);
        assert_eq!(win.pending_retransmissions(), 0);
    }

    #[test]
    fn test_ack_sender_window_ack_is_idempotent() {
        let (resend, _) = recording_resend();
        let win = AckSenderWindow::new(addr(2), resend, TimeScheduler::new(), vec![], 0, 0);

        win.add(1, msg(1));

        assert!(win.ack(1).is_empty());
        assert!(win.ack(1).is_empty());
        assert!(win.ack(99).is_empty());
        assert_eq!(win.size(), 0);
    }

    #[test]
    fn test_ack_sender_window_throttles_and_releases() {
        // ARRANGE: At most 2 in flight, release once fewer than 1
        let (resend, _) = recording_resend();
        let win = AckSenderWindow::new(addr(2), resend, TimeScheduler::new(), vec![], 2, 1);

        // ACT
        assert!(win.add(1, msg(1)));
        assert!(win.add(2, msg(2)));
        assert!(!win.add(3, msg(3)), "window full, queued");
        assert!(!win.add(4, msg(4)));

        // ASSERT
        assert_eq!(win.size(), 2);
        assert_eq!(win.queued_count(), 2);

        // ACT: One ack leaves 1 in flight, not below the threshold
        assert!(win.ack(1).is_empty());

        // ACT: Second ack drops below the threshold and refills the window
        let released: Vec<Seqno> = win.ack(2).into_iter().map(|(s, _)| s).collect();

        // ASSERT
        assert_eq!(released, vec![3, 4]);
        assert_eq!(win.size(), 2);
        assert_eq!(win.queued_count(), 0);
        win.reset();
    }

    #[test]
    fn test_ack_sender_window_holds_back_until_below_min_threshold() {
        // ARRANGE: Window of 3, queued messages wait until fewer than 2 are in flight
        let (resend, _) = recording_resend();
        let win = AckSenderWindow::new(addr(2), resend, TimeScheduler::new(), vec![], 3, 2);

        // ACT: Five adds before any ack
        let sent_now: Vec<bool> = (1..=5).map(|seqno| win.add(seqno, msg(seqno))).collect();

        // ASSERT: #4 and #5 are queued
        assert_eq!(sent_now, vec![true, true, true, false, false]);
        assert_eq!((win.size(), win.queued_count()), (3, 2));

        // ACT: 2 left in flight is not below the threshold
        let released = win.ack(1);

        // ASSERT
        assert!(released.is_empty());
        assert_eq!((win.size(), win.queued_count()), (2, 2));

        // ACT: 1 left in flight
        let released: Vec<Seqno> = win.ack(2).into_iter().map(|(s, _)| s).collect();

        // ASSERT
        assert_eq!(released, vec![4, 5]);
        assert_eq!((win.size(), win.queued_count()), (3, 0));
        win.reset();
    }

    #[test]
    fn test_ack_receiver_window_reorders() {
        let mut win = AckReceiverWindow::new(1);

        assert!(win.add(3, msg(3)));
        assert!(win.add(2, msg(2)));
        assert!(win.remove().is_none(), "#1 not there yet");

        assert!(win.add(1, msg(1)));
        let delivered: Vec<Seqno> = std::iter::from_fn(|| win.remove())
            .map(|m| seqno_of(&m))
            .collect();

        assert_eq!(delivered, vec![1, 2, 3]);
        assert_eq!(win.next_to_remove(), 4);
    }

    #[test]
    fn test_ack_receiver_window_rejects_duplicates() {
        let mut win = AckReceiverWindow::new(1);

        assert!(win.add(1, msg(1)));
        assert!(!win.add(1, msg(1)));
        win.remove();
        assert!(!win.add(1, msg(1)), "already delivered");
        assert_eq!(win.size(), 0);
    }
}
