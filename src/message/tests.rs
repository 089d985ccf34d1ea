//! Message Module Tests
//!
//! ## Test Scopes
//! - **Address**: Ordering (ip, then port), parsing and multicast detection.
//! - **Message**: Header bookkeeping, destination semantics and the bincode wire format.
//! - **Event**: Mapping of events to their service types.

#[cfg(test)]
mod tests {
    use crate::membership::{Digest, View, ViewId};
    use crate::message::{Address, Event, EventType, Header, Message};
    use crate::protocols::gms::GmsHeader;
    use crate::protocols::nakack::NakAckHeader;
    use crate::protocols::unicast::UnicastHeader;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    // ============================================================
    // TEST 1: Address - Ordering and Parsing
    // ============================================================

    #[test]
    fn test_address_orders_by_ip_then_port() {
        let a = addr("10.0.0.1:9000");
        let b = addr("10.0.0.2:1000");
        let c = addr("10.0.0.2:2000");

        assert!(a < b, "lower ip wins regardless of port");
        assert!(b < c, "same ip falls back to port");

        let mut sorted = vec![c, a, b];
        sorted.sort();
        assert_eq!(sorted, vec![a, b, c]);
    }

    #[test]
    fn test_address_display_roundtrip() {
        let a = addr("127.0.0.1:7800");
        assert_eq!(a.to_string(), "127.0.0.1:7800");
        assert_eq!(a.port(), 7800);
        assert_eq!(a.to_string().parse::<Address>().unwrap(), a);
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!("not-an-address".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_multicast_detection() {
        assert!(addr("228.8.8.8:45566").is_multicast());
        assert!(!addr("192.168.1.10:45566").is_multicast());
    }

    // ============================================================
    // TEST 2: Message - Headers and Destinations
    // ============================================================

    #[test]
    fn test_message_headers_are_keyed_by_layer_name() {
        // ARRANGE
        let mut msg = Message::multicast(b"hello".to_vec());

        // ACT
        msg.put_header("NAKACK", Header::NakAck(NakAckHeader::msg(7)));
        msg.put_header("UNICAST", Header::Unicast(UnicastHeader::data(1, true, 42)));

        // ASSERT
        assert_eq!(msg.header_count(), 2);
        assert_eq!(
            msg.get_header("NAKACK"),
            Some(&Header::NakAck(NakAckHeader::msg(7)))
        );

        let removed = msg.remove_header("NAKACK");
        assert_eq!(removed, Some(Header::NakAck(NakAckHeader::msg(7))));
        assert!(msg.get_header("NAKACK").is_none());
        assert!(msg.remove_header("NAKACK").is_none(), "removing twice yields nothing");
        assert_eq!(msg.header_count(), 1);
    }

    #[test]
    fn test_message_put_header_replaces_existing() {
        let mut msg = Message::multicast(Vec::new());
        msg.put_header("NAKACK", Header::NakAck(NakAckHeader::msg(1)));
        msg.put_header("NAKACK", Header::NakAck(NakAckHeader::msg(2)));

        assert_eq!(msg.header_count(), 1);
        assert_eq!(
            msg.get_header("NAKACK"),
            Some(&Header::NakAck(NakAckHeader::msg(2)))
        );
    }

    #[test]
    fn test_message_destination_semantics() {
        let peer = addr("127.0.0.1:7801");

        assert!(Message::multicast(Vec::new()).is_multicast());
        assert!(!Message::unicast(peer, Vec::new()).is_multicast());
        assert!(Message::unicast(addr("228.8.8.8:7800"), Vec::new()).is_multicast());
    }

    #[test]
    fn test_message_wire_format_keeps_every_field() {
        // ARRANGE: A message as it looks right above the transport
        let a = addr("127.0.0.1:7800");
        let b = addr("127.0.0.1:7801");
        let view = View::new(ViewId::new(a, 3), vec![a, b]);
        let mut digest = Digest::new();
        digest.add(a, 0, 12);

        let mut msg = Message::new(None, Some(a), b"payload".to_vec());
        msg.put_header("NAKACK", Header::NakAck(NakAckHeader::msg(12)));
        msg.put_header("GMS", Header::Gms(GmsHeader::view(view)));

        // ACT
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        // ASSERT
        assert_eq!(decoded, msg);
        assert!(msg.size() >= bytes.len());
    }

    #[test]
    fn test_message_from_bytes_rejects_truncated_input() {
        let msg = Message::new(None, Some(addr("127.0.0.1:7800")), vec![1, 2, 3]);
        let bytes = msg.to_bytes().unwrap();

        assert!(Message::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    // ============================================================
    // TEST 3: Event - Service Types
    // ============================================================

    #[test]
    fn test_event_kind_matches_variant() {
        let a = addr("127.0.0.1:7800");

        assert_eq!(Event::Msg(Message::multicast(Vec::new())).kind(), EventType::Msg);
        assert_eq!(Event::Connect("g".into()).kind(), EventType::Connect);
        assert_eq!(Event::Disconnect(a).kind(), EventType::Disconnect);
        assert_eq!(Event::GetDigestStable.kind(), EventType::GetDigestStable);
        assert_eq!(
            Event::GetDigestStableOk(Digest::new()).kind(),
            EventType::GetDigestStableOk
        );
        assert_eq!(Event::Stable(Digest::new()).kind(), EventType::Stable);
        assert_eq!(Event::Exit.kind(), EventType::Exit);
    }
}
