//! Group Scenario Tests
//!
//! Whole stacks (LOOPBACK:PING:NAKACK:UNICAST:STABLE:GMS:CAUSAL) talking over
//! one in-process network with short timeouts.
//!
//! ## Test Scopes
//! - **Membership**: Joining, consistent views, leaving and coordinator handover.
//! - **Reliability**: Ordered delivery with and without message loss.
//! - **Digests & GC**: Joiner digests and stability-driven send log trimming.
//! - **Failures**: Coordinator takeover after a suspicion.
//! - **Causality**: Replies never overtake the message they answer.

#[cfg(test)]
mod tests {
    use crate::message::{Address, Event, Message};
    use crate::protocols::causal::{Causal, CausalConfig};
    use crate::protocols::gms::{Gms, GmsConfig};
    use crate::protocols::nakack::{NakAck, NakAckConfig};
    use crate::protocols::ping::{Ping, PingConfig};
    use crate::protocols::stable::{Stable, StableConfig};
    use crate::protocols::unicast::{Unicast, UnicastConfig};
    use crate::scheduler::TimeScheduler;
    use crate::stack::{Channel, Protocol};
    use crate::transport::{LoopbackNetwork, LoopbackTransport};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct Node {
        channel: Channel,
        transport: Arc<LoopbackTransport>,
        nakack: Arc<NakAck>,
        gms: Arc<Gms>,
    }

    impl Node {
        fn addr(&self) -> Address {
            self.transport.local_addr()
        }

        fn view_members(&self) -> Vec<Address> {
            self.gms.view().map(|v| v.members().to_vec()).unwrap_or_default()
        }
    }

    fn build(transport: Arc<LoopbackTransport>, hosts: &[SocketAddr]) -> Node {
        let scheduler = TimeScheduler::new();

        let ping = Ping::new(PingConfig {
            initial_hosts: hosts.to_vec(),
            timeout: 300,
            num_initial_members: 2,
        });
        let nakack = NakAck::new(
            NakAckConfig {
                retransmit_timeout: vec![50, 100, 200],
                gc_lag: 0,
                ..NakAckConfig::default()
            },
            scheduler.clone(),
        );
        let unicast = Unicast::new(
            UnicastConfig {
                timeout: vec![50, 100, 200],
                ..UnicastConfig::default()
            },
            scheduler.clone(),
        );
        let stable = Stable::new(
            StableConfig {
                desired_avg_gossip: 50,
                stability_delay: 20,
                max_gossip_runs: 20,
            },
            scheduler.clone(),
        );
        let gms = Gms::new(GmsConfig {
            join_timeout: 2_000,
            join_retry_timeout: 100,
            leave_timeout: 1_000,
            digest_timeout: 1_000,
            coord_leave_grace: 100,
            ..GmsConfig::default()
        });
        let causal = Causal::new(CausalConfig::default());

        let layers: Vec<Arc<dyn Protocol>> = vec![
            transport.clone(),
            ping,
            nakack.clone(),
            unicast,
            stable,
            gms.clone(),
            causal,
        ];
        let channel = Channel::from_layers(layers, scheduler, true, Duration::from_secs(10))
            .expect("valid stack");

        Node {
            channel,
            transport,
            nakack,
            gms,
        }
    }

    /// `count` unstarted nodes on `network`, each seeded with every address.
    fn cluster(network: &Arc<LoopbackNetwork>, count: usize) -> Vec<Node> {
        let transports: Vec<Arc<LoopbackTransport>> = (0..count)
            .map(|_| LoopbackTransport::new(network.clone()))
            .collect();
        let hosts: Vec<SocketAddr> = transports
            .iter()
            .map(|t| t.local_addr().socket_addr())
            .collect();
        transports.into_iter().map(|t| build(t, &hosts)).collect()
    }

    /// Connects the nodes one after the other and waits until all agree on a view.
    async fn form_group(nodes: &[Node]) {
        for node in nodes {
            node.channel.connect("scenario").await.expect("connect");
        }
        let expected: Vec<Address> = nodes.iter().map(|n| n.addr()).collect();
        assert!(
            wait_until(Duration::from_secs(5), || nodes
                .iter()
                .all(|n| n.view_members() == expected))
            .await,
            "views did not converge"
        );
    }

    async fn wait_until<F: Fn() -> bool>(within: Duration, cond: F) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    /// Application payloads received within `within`, stopping early at `count`.
    async fn collect(node: &Node, count: usize, within: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + within;
        let mut payloads = Vec::new();
        while payloads.len() < count && Instant::now() < deadline {
            if let Ok(Some(Event::Msg(msg))) = node.channel.receive(Duration::from_millis(50)).await
            {
                payloads.push(msg.payload);
            }
        }
        payloads
    }

    async fn shutdown(nodes: &[Node]) {
        for node in nodes.iter().rev() {
            node.channel.close().await;
        }
    }

    fn numbered(prefix: u8, count: u8) -> Vec<Vec<u8>> {
        (0..count).map(|i| vec![prefix, i]).collect()
    }

    // ============================================================
    // TEST 1: Membership
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_members_agree_on_view() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 3);

        // ACT
        form_group(&nodes).await;

        // ASSERT: Same view id everywhere, first member coordinates
        let vids: Vec<_> = nodes.iter().map(|n| n.gms.view().map(|v| v.vid())).collect();
        assert!(vids.iter().all(|vid| *vid == vids[0]));
        assert!(nodes[0].gms.role().is_coordinator());
        assert!(!nodes[1].gms.role().is_coordinator());
        assert_eq!(nodes[2].channel.view().map(|v| v.size()), Some(3));

        shutdown(&nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_member_leaves() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 3);
        form_group(&nodes).await;

        // ACT
        nodes[2].channel.disconnect().await.unwrap();

        // ASSERT
        let remaining = vec![nodes[0].addr(), nodes[1].addr()];
        assert!(
            wait_until(Duration::from_secs(3), || nodes[0].view_members() == remaining
                && nodes[1].view_members() == remaining)
            .await
        );
        assert!(!nodes[2].channel.is_connected());
        assert!(!nodes[2].gms.role().is_member());

        shutdown(&nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coordinator_leave_hands_over() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 3);
        form_group(&nodes).await;

        // ACT
        nodes[0].channel.disconnect().await.unwrap();

        // ASSERT
        let remaining = vec![nodes[1].addr(), nodes[2].addr()];
        assert!(
            wait_until(Duration::from_secs(3), || nodes[1].view_members() == remaining
                && nodes[2].view_members() == remaining)
            .await
        );
        assert!(nodes[1].gms.role().is_coordinator());

        shutdown(&nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_member_can_rejoin() {
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 2);
        form_group(&nodes).await;

        nodes[1].channel.disconnect().await.unwrap();
        nodes[1].channel.connect("scenario").await.unwrap();

        let both = vec![nodes[0].addr(), nodes[1].addr()];
        assert!(
            wait_until(Duration::from_secs(3), || nodes[0].view_members() == both
                && nodes[1].view_members() == both)
            .await
        );

        shutdown(&nodes).await;
    }

    // ============================================================
    // TEST 2: Reliable delivery
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_multicast_reaches_everyone_in_order() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 3);
        form_group(&nodes).await;
        let expected = numbered(b'a', 20);

        // ACT
        for payload in &expected {
            nodes[0].channel.send_to(None, payload.clone()).unwrap();
        }

        // ASSERT: Including the sender itself
        for node in &nodes {
            let received = collect(node, expected.len(), Duration::from_secs(5)).await;
            assert_eq!(received, expected, "at {}", node.addr());
        }

        shutdown(&nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_multicast_survives_message_loss() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 3);
        form_group(&nodes).await;
        network.set_drop_rate(0.2);
        network.set_max_delay(Duration::from_millis(5));
        let expected = numbered(b'l', 20);

        // ACT
        for payload in &expected {
            nodes[0].channel.send_to(None, payload.clone()).unwrap();
        }

        // ASSERT
        for node in &nodes[1..] {
            let received = collect(node, expected.len(), Duration::from_secs(15)).await;
            assert_eq!(received, expected, "at {}", node.addr());
        }
        assert!(network.dropped_count() > 0);

        network.set_drop_rate(0.0);
        shutdown(&nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unicast_survives_message_loss() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 2);
        form_group(&nodes).await;
        network.set_drop_rate(0.3);
        let expected = numbered(b'u', 10);

        // ACT
        for payload in &expected {
            nodes[0]
                .channel
                .send(Message::new(Some(nodes[1].addr()), None, payload.clone()))
                .unwrap();
        }

        // ASSERT: Exactly once, in order
        let received = collect(&nodes[1], expected.len() + 1, Duration::from_secs(10)).await;
        assert_eq!(received, expected);

        network.set_drop_rate(0.0);
        shutdown(&nodes).await;
    }

    // ============================================================
    // TEST 3: Digests and garbage collection
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_joiner_starts_after_existing_traffic() {
        // ARRANGE: A talks alone first
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 2);
        nodes[0].channel.connect("scenario").await.unwrap();
        for payload in numbered(b'o', 5) {
            nodes[0].channel.send_to(None, payload).unwrap();
        }
        assert_eq!(collect(&nodes[0], 5, Duration::from_secs(2)).await.len(), 5);

        // ACT
        nodes[1].channel.connect("scenario").await.unwrap();
        assert!(
            wait_until(Duration::from_secs(3), || nodes[0].view_members().len() == 2).await
        );
        nodes[0].channel.send_to(None, b"new".to_vec()).unwrap();

        // ASSERT: B has windows for both members and never sees the old messages
        let digest = nodes[1].nakack.digest();
        assert_eq!(digest.size(), 2);
        assert!(digest.contains(&nodes[0].addr()));
        assert!(digest.contains(&nodes[1].addr()));

        let received = collect(&nodes[1], 1, Duration::from_secs(5)).await;
        assert_eq!(received, vec![b"new".to_vec()]);

        shutdown(&nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stability_trims_send_log() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 3);
        form_group(&nodes).await;

        // ACT
        for payload in numbered(b's', 10) {
            nodes[0].channel.send_to(None, payload).unwrap();
        }
        for node in &nodes {
            assert_eq!(collect(node, 10, Duration::from_secs(5)).await.len(), 10);
        }

        // ASSERT: Everything sent so far leaves the send log once everybody has it
        let sender = nodes[0].nakack.clone();
        let last_sent = sender.sent_log_seqnos().into_iter().max().expect("logged");
        assert!(
            wait_until(Duration::from_secs(10), || sender
                .sent_log_seqnos()
                .iter()
                .all(|seqno| *seqno > last_sent))
            .await,
            "send log never trimmed: {:?}",
            sender.sent_log_seqnos()
        );

        shutdown(&nodes).await;
    }

    // ============================================================
    // TEST 4: Failures
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_next_member_takes_over_from_crashed_coordinator() {
        // ARRANGE
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 3);
        form_group(&nodes).await;
        let crashed = nodes[0].addr();

        // ACT: A disappears and both survivors suspect it
        network.isolate(crashed);
        nodes[1].transport.raise(Event::Suspect(crashed));
        nodes[2].transport.raise(Event::Suspect(crashed));

        // ASSERT
        let survivors = vec![nodes[1].addr(), nodes[2].addr()];
        assert!(
            wait_until(Duration::from_secs(5), || nodes[1].view_members() == survivors
                && nodes[2].view_members() == survivors)
            .await
        );
        assert!(nodes[1].gms.role().is_coordinator());
        assert_eq!(
            nodes[2].gms.view().map(|v| v.vid().coord),
            Some(nodes[1].addr())
        );

        // ASSERT: The survivors keep talking
        nodes[2].channel.send_to(None, b"still here".to_vec()).unwrap();
        let received = collect(&nodes[1], 1, Duration::from_secs(5)).await;
        assert_eq!(received, vec![b"still here".to_vec()]);

        shutdown(&nodes[1..]).await;
        nodes[0].channel.close().await;
    }

    // ============================================================
    // TEST 5: Causal order
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reply_never_overtakes_question() {
        // ARRANGE: Random per-message delays reorder traffic
        let network = LoopbackNetwork::new();
        let nodes = cluster(&network, 3);
        form_group(&nodes).await;
        network.set_max_delay(Duration::from_millis(30));

        for round in 0..5u8 {
            // ACT: A asks, B answers as soon as it has seen the question
            let question = vec![b'q', round];
            let answer = vec![b'r', round];
            nodes[0].channel.send_to(None, question.clone()).unwrap();
            assert_eq!(
                collect(&nodes[1], 1, Duration::from_secs(5)).await,
                vec![question.clone()]
            );
            nodes[1].channel.send_to(None, answer.clone()).unwrap();

            // ASSERT: C sees them in causal order
            let at_c = collect(&nodes[2], 2, Duration::from_secs(5)).await;
            assert_eq!(at_c, vec![question, answer.clone()], "round {}", round);

            // Drain the rest so the next round starts clean
            assert_eq!(collect(&nodes[0], 2, Duration::from_secs(5)).await.len(), 2);
            assert_eq!(collect(&nodes[1], 1, Duration::from_secs(5)).await, vec![answer]);
        }

        network.set_max_delay(Duration::ZERO);
        shutdown(&nodes).await;
    }
}
