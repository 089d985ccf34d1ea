//! Transport Module Tests
//!
//! ## Test Scopes
//! - **Fanout**: Multicast targets from installed and temporary views.
//! - **Loopback**: Unicast, emulated multicast, isolation and loss.
//! - **UDP**: Binding, local address announcement and a real datagram round trip.

#[cfg(test)]
mod tests {
    use crate::membership::{View, ViewId};
    use crate::message::{Address, Event, Header, Message};
    use crate::protocols::nakack::NakAckHeader;
    use crate::protocols::unicast::UnicastHeader;
    use crate::stack::{EventSink, Protocol, StackError};
    use crate::transport::udp::{MAX_PAYLOAD, UdpConfig};
    use crate::transport::{Fanout, LoopbackNetwork, LoopbackTransport, UdpTransport};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn view(members: &[Address]) -> View {
        View::new(ViewId::new(members[0], 1), members.to_vec())
    }

    #[derive(Default)]
    struct Inbox {
        events: Mutex<Vec<Event>>,
    }

    impl EventSink for Inbox {
        fn handle(&self, evt: Event) -> Result<(), StackError> {
            self.events.lock().unwrap().push(evt);
            Ok(())
        }
    }

    impl Inbox {
        fn msgs(&self) -> Vec<Message> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|evt| match evt {
                    Event::Msg(msg) => Some(msg.clone()),
                    _ => None,
                })
                .collect()
        }

        async fn wait_for_msgs(&self, count: usize) -> Vec<Message> {
            for _ in 0..100 {
                if self.msgs().len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.msgs()
        }
    }

    fn endpoint(network: &Arc<LoopbackNetwork>) -> (Arc<LoopbackTransport>, Arc<Inbox>) {
        let transport = LoopbackTransport::new(network.clone());
        let inbox = Arc::new(Inbox::default());
        transport.links().set_up(inbox.clone());
        transport.start().unwrap();
        (transport, inbox)
    }

    // ============================================================
    // TEST 1: Fanout
    // ============================================================

    #[test]
    fn test_fanout_includes_local_once() {
        let (a, b) = (addr(1), addr(2));
        let fanout = Fanout::default();

        assert_eq!(fanout.targets(a), vec![a]);

        fanout.set_view(&view(&[a, b]));
        assert_eq!(fanout.targets(a), vec![a, b]);
    }

    #[test]
    fn test_fanout_tmp_view_adds_joiners() {
        // ARRANGE
        let (a, b, c) = (addr(1), addr(2), addr(3));
        let fanout = Fanout::default();
        fanout.set_view(&view(&[a, b]));

        // ACT
        fanout.add_tmp_view(&view(&[a, b, c]));

        // ASSERT
        assert_eq!(fanout.targets(a), vec![a, b, c]);

        // The next installed view replaces everything
        fanout.set_view(&view(&[a, c]));
        assert_eq!(fanout.targets(a), vec![a, c]);
        fanout.clear();
        assert_eq!(fanout.targets(b), vec![b]);
    }

    // ============================================================
    // TEST 2: Loopback
    // ============================================================

    #[tokio::test]
    async fn test_loopback_announces_address() {
        let network = LoopbackNetwork::new();
        let (transport, inbox) = endpoint(&network);

        let events = inbox.events.lock().unwrap().clone();
        assert!(
            matches!(events.as_slice(), [Event::SetLocalAddress(a)] if *a == transport.local_addr())
        );
    }

    #[tokio::test]
    async fn test_loopback_unicast_stamps_source() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let (a, _) = endpoint(&network);
        let (b, b_inbox) = endpoint(&network);

        // ACT
        a.down(Event::Msg(Message::unicast(b.local_addr(), b"hello".to_vec())));

        // ASSERT
        let msgs = b_inbox.wait_for_msgs(1).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, b"hello".to_vec());
        assert_eq!(msgs[0].src, Some(a.local_addr()));
        assert_eq!(network.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_loopback_multicast_reaches_view_and_self() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let (a, a_inbox) = endpoint(&network);
        let (b, b_inbox) = endpoint(&network);
        let (_c, c_inbox) = endpoint(&network);
        a.down(Event::ViewChange(view(&[a.local_addr(), b.local_addr()])));

        // ACT
        a.down(Event::Msg(Message::multicast(b"all".to_vec())));

        // ASSERT: C is not a member
        assert_eq!(a_inbox.wait_for_msgs(1).await.len(), 1);
        assert_eq!(b_inbox.wait_for_msgs(1).await.len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(c_inbox.msgs().is_empty());
    }

    #[tokio::test]
    async fn test_loopback_isolation_and_heal() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let (a, _) = endpoint(&network);
        let (b, b_inbox) = endpoint(&network);

        // ACT
        network.isolate(b.local_addr());
        a.down(Event::Msg(Message::unicast(b.local_addr(), vec![1])));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // ASSERT
        assert!(b_inbox.msgs().is_empty());
        assert_eq!(network.dropped_count(), 1);

        // ACT
        network.heal(&b.local_addr());
        a.down(Event::Msg(Message::unicast(b.local_addr(), vec![2])));

        // ASSERT
        let msgs = b_inbox.wait_for_msgs(1).await;
        assert_eq!(msgs[0].payload, vec![2]);
    }

    #[tokio::test]
    async fn test_loopback_loss_spares_self_delivery() {
        // ARRANGE: Everything between two endpoints is lost
        let network = LoopbackNetwork::with_faults(1.0, Duration::ZERO);
        let (a, a_inbox) = endpoint(&network);
        let (b, b_inbox) = endpoint(&network);
        a.down(Event::ViewChange(view(&[a.local_addr(), b.local_addr()])));

        // ACT
        a.down(Event::Msg(Message::multicast(vec![9])));

        // ASSERT
        assert_eq!(a_inbox.wait_for_msgs(1).await.len(), 1);
        assert!(b_inbox.msgs().is_empty());
        assert_eq!(network.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_loopback_delay_still_delivers_everything() {
        let network = LoopbackNetwork::with_faults(0.0, Duration::from_millis(20));
        let (a, _) = endpoint(&network);
        let (b, b_inbox) = endpoint(&network);

        for i in 0..10u8 {
            a.down(Event::Msg(Message::unicast(b.local_addr(), vec![i])));
        }

        let mut payloads: Vec<u8> = b_inbox
            .wait_for_msgs(10)
            .await
            .iter()
            .map(|m| m.payload[0])
            .collect();
        payloads.sort();
        assert_eq!(payloads, (0..10u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_loopback_stop_unregisters() {
        let network = LoopbackNetwork::new();
        let (a, _) = endpoint(&network);
        let (b, b_inbox) = endpoint(&network);

        b.stop();
        a.down(Event::Msg(Message::unicast(b.local_addr(), vec![1])));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(b_inbox.msgs().is_empty());
        assert_eq!(network.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_loopback_raise_passes_up() {
        let network = LoopbackNetwork::new();
        let (a, inbox) = endpoint(&network);
        let peer = addr(9);

        a.raise(Event::Suspect(peer));

        let events = inbox.events.lock().unwrap().clone();
        assert!(matches!(events.last(), Some(Event::Suspect(p)) if *p == peer));
    }

    #[test]
    fn test_loopback_allocates_distinct_addresses() {
        let network = LoopbackNetwork::new();

        let first = network.allocate_address();
        let second = network.allocate_address();

        assert_ne!(first, second);
        assert!(first < second);
    }

    // ============================================================
    // TEST 3: UDP
    // ============================================================

    #[tokio::test]
    async fn test_udp_binds_and_exchanges_datagrams() {
        // ARRANGE
        let a = UdpTransport::new(UdpConfig::default());
        let b = UdpTransport::new(UdpConfig::default());
        let a_inbox = Arc::new(Inbox::default());
        let b_inbox = Arc::new(Inbox::default());
        a.links().set_up(a_inbox.clone());
        b.links().set_up(b_inbox.clone());

        // ACT
        a.start().unwrap();
        b.start().unwrap();
        let (Some(a_addr), Some(b_addr)) = (a.local_addr(), b.local_addr()) else {
            panic!("transports did not bind");
        };
        a.down(Event::Msg(Message::unicast(b_addr, b"ping".to_vec())));

        // ASSERT
        let msgs = b_inbox.wait_for_msgs(1).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, b"ping".to_vec());
        assert_eq!(msgs[0].src, Some(a_addr));
        assert_ne!(a_addr.port(), 0);
        assert!(matches!(
            a_inbox.events.lock().unwrap().first(),
            Some(Event::SetLocalAddress(local)) if *local == a_addr
        ));

        a.stop();
        b.stop();
    }

    #[test]
    fn test_udp_send_before_start_is_dropped() {
        let transport = UdpTransport::new(UdpConfig::default());

        transport.down(Event::Msg(Message::multicast(vec![])));

        assert!(transport.local_addr().is_none());
    }

    #[test]
    fn test_udp_start_fails_on_taken_port() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = UdpConfig {
            bind_addr: taken.local_addr().unwrap(),
        };

        let result = UdpTransport::new(config).start();

        assert!(result.is_err());
    }

    #[test]
    fn test_udp_payload_limit_fits_one_datagram() {
        // ARRANGE: Largest accepted payload with a few headers
        let transport = UdpTransport::new(UdpConfig::default());
        let mut msg = Message::multicast(vec![7; MAX_PAYLOAD]);
        msg.put_header("NAKACK", Header::NakAck(NakAckHeader::msg(42)));
        msg.put_header("UNICAST", Header::Unicast(UnicastHeader::data(3, true, 1)));

        // ACT
        let bytes = msg.to_bytes().unwrap();

        // ASSERT: Still one datagram, with room to spare for a retransmission bundle
        assert_eq!(transport.max_payload(), Some(MAX_PAYLOAD));
        assert!(bytes.len() + 1024 <= 65507, "{} bytes", bytes.len());
    }
}
