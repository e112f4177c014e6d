//! Hierarchical Follower
//!
//! Follows competitions, their distances and the distances' heats as they
//! are activated on the broker. Every followed entity gets its own task and
//! its own cancellation scope below its parent's:
//!
//! ```text
//! root (competition activations)
//!   └─► competition task: own events + distance activations
//!         └─► distance task: own events + heat activations (groups merged)
//!               └─► heat task: own events
//! ```
//!
//! A new activation for an identity that is already followed supersedes it:
//! the old subtree is cancelled and waited for before the new context is
//! created. A deactivation cancels the subtree without replacing it.
//!
//! Contexts and raw events are handed to the consumer over single-slot
//! queues, so a slow consumer stalls the level it is reading and nothing
//! below it.

mod context;

pub use context::{
    CompetitionContext, ContextParts, DistanceContext, EntityContext, HeatContext,
};

use context::ContextSenders;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{
    Activation, CompetitionActivated, DistanceActivated, HeatActivated, Raw, Signal,
};
use crate::scope::{send_scoped, Children, HANDOFF_CAPACITY};
use crate::source::{Source, SourceResult};

/// Follows the live competition tree of a [`Source`]
#[derive(Clone)]
pub struct Follower {
    source: Source,
}

impl Follower {
    pub fn new(source: Source) -> Self {
        Self { source }
    }

    /// Start following competitions activated within `history`.
    ///
    /// When `filter` is non-empty, competitions whose ID is not listed are
    /// ignored. The returned queue closes when `token` is cancelled; by then
    /// every context handed out has been closed too.
    pub async fn run(
        &self,
        token: &CancellationToken,
        history: Duration,
        filter: &[String],
    ) -> SourceResult<mpsc::Receiver<CompetitionContext>> {
        let mut activations = self.source.competition_activations(token, history).await?;
        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);

        let source = self.source.clone();
        let token = token.clone();
        let filter: HashSet<String> = filter.iter().cloned().collect();
        tokio::spawn(async move {
            let mut children = Children::new(token.clone());
            let follow = |activation, scope, senders| {
                follow_competition(source.clone(), activation, scope, senders)
            };
            loop {
                let signal = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    signal = activations.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                };
                if !filter.is_empty() && !filter.contains(&signal.key()) {
                    tracing::trace!(competition_id = %signal.key(), "Competition filtered out");
                    continue;
                }
                if !apply_signal(signal, &mut children, &tx, &token, &follow).await {
                    break;
                }
            }
            children.shutdown().await;
            tracing::debug!("Follower stopped");
        });

        Ok(rx)
    }
}

/// Act on one activation-subject signal of a child level.
///
/// An activation retires any live child with the same identity, hands the
/// new context to the consumer and only then spawns the task following it.
/// A deactivation retires the child. Returns false when the parent scope is
/// cancelled.
async fn apply_signal<A, C, F, Fut>(
    signal: Signal<A>,
    children: &mut Children<A::Key>,
    out: &mpsc::Sender<EntityContext<A, C>>,
    scope: &CancellationToken,
    follow: &F,
) -> bool
where
    A: Activation,
    C: Send + 'static,
    F: Fn(A, CancellationToken, ContextSenders<C>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    match signal {
        Signal::Activated(activation) => {
            let key = activation.key();
            if children.retire(&key).await {
                tracing::debug!(key = ?key, activation = A::ACTIVATED, "Superseded previous activation");
            }

            let child_scope = children.scope();
            let (context, senders) = EntityContext::new(activation.clone(), child_scope.clone());
            if !send_scoped(out, context, scope).await {
                // Consumer no longer takes children at this level.
                child_scope.cancel();
                return !scope.is_cancelled();
            }
            let task = tokio::spawn(follow(activation, child_scope.clone(), senders));
            children.insert(key, child_scope, task);
            true
        }
        Signal::Deactivated(key) => {
            if children.retire(&key).await {
                tracing::debug!(key = ?key, deactivation = A::DEACTIVATED, "Deactivated");
            }
            true
        }
    }
}

/// Forward own events and act on child activations until the scope ends
async fn drive<A, C, F, Fut>(
    scope: CancellationToken,
    senders: ContextSenders<EntityContext<A, C>>,
    mut events: mpsc::Receiver<Raw>,
    mut activations: mpsc::Receiver<Signal<A>>,
    follow: F,
) where
    A: Activation,
    C: Send + 'static,
    F: Fn(A, CancellationToken, ContextSenders<C>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut children = Children::new(scope.clone());
    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            Some(raw) = events.recv() => {
                if !send_scoped(&senders.events, raw, &scope).await && scope.is_cancelled() {
                    break;
                }
            }
            Some(signal) = activations.recv() => {
                if !apply_signal(signal, &mut children, &senders.children, &scope, &follow).await {
                    break;
                }
            }
            else => break,
        }
    }
    children.shutdown().await;
}

async fn follow_competition(
    source: Source,
    activation: CompetitionActivated,
    scope: CancellationToken,
    senders: ContextSenders<DistanceContext>,
) {
    let competition_id = activation.competition_id.clone();
    tracing::debug!(
        competition_id = %competition_id,
        competition_name = %activation.competition.name,
        "Following competition"
    );

    let streams = async {
        let events = source.competition_events(&scope, &activation).await?;
        let distances = source.distance_activations(&scope, &competition_id).await?;
        SourceResult::Ok((events, distances))
    };
    match streams.await {
        Ok((events, distances)) => {
            let follow = |activation, scope, senders| {
                follow_distance(source.clone(), activation, scope, senders)
            };
            drive(scope.clone(), senders, events, distances, follow).await;
        }
        Err(e) => {
            tracing::error!(competition_id = %competition_id, error = %e, "Failed to follow competition");
        }
    }

    tracing::debug!(competition_id = %competition_id, "Stopped following competition");
}

async fn follow_distance(
    source: Source,
    activation: DistanceActivated,
    scope: CancellationToken,
    senders: ContextSenders<HeatContext>,
) {
    let competition_id = activation.competition_id.clone();
    let distance_id = activation.distance_id.clone();
    let groups = activation.distance.heat_groups();
    tracing::debug!(
        competition_id = %competition_id,
        distance_id = %distance_id,
        distance_name = %activation.distance.name,
        groups = ?groups,
        "Following distance"
    );

    let streams = async {
        let events = source.distance_events(&scope, &activation).await?;
        let heats = source
            .heat_activations(&scope, &competition_id, &distance_id, &groups)
            .await?;
        SourceResult::Ok((events, heats))
    };
    match streams.await {
        Ok((events, heats)) => {
            let follow =
                |activation, scope, senders| follow_heat(source.clone(), activation, scope, senders);
            drive(scope.clone(), senders, events, heats, follow).await;
        }
        Err(e) => {
            tracing::error!(
                competition_id = %competition_id,
                distance_id = %distance_id,
                error = %e,
                "Failed to follow distance"
            );
        }
    }

    tracing::debug!(competition_id = %competition_id, distance_id = %distance_id, "Stopped following distance");
}

async fn follow_heat(
    source: Source,
    activation: HeatActivated,
    scope: CancellationToken,
    senders: ContextSenders<std::convert::Infallible>,
) {
    let ContextSenders { events: events_tx, children } = senders;
    // Heats have no children; closing the queue right away tells the consumer.
    drop(children);

    let heat = activation.heat;
    tracing::debug!(
        competition_id = %activation.competition_id,
        distance_id = %activation.distance_id,
        heat_round = heat.round,
        heat_number = heat.number,
        "Following heat"
    );

    let mut events = match source.heat_events(&scope, &activation).await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!(heat = %heat, error = %e, "Failed to follow heat");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            raw = events.recv() => match raw {
                Some(raw) => {
                    if !send_scoped(&events_tx, raw, &scope).await && scope.is_cancelled() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    tracing::debug!(heat_round = heat.round, heat_number = heat.number, "Stopped following heat");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::events::HeatKey;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(100);
    const DAY: Duration = Duration::from_secs(24 * 3600);

    struct Harness {
        broker: Arc<MemoryBroker>,
        follower: Follower,
        token: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            let broker = Arc::new(MemoryBroker::new());
            let follower = Follower::new(Source::new(broker.clone()));
            Self {
                broker,
                follower,
                token: CancellationToken::new(),
            }
        }

        async fn publish(&self, subject: &str, data: String) {
            self.broker.publish(subject, data).await.unwrap();
        }

        async fn activate_competition(&self, id: &str) {
            self.publish(
                "competition.activations",
                format!(
                    r#"{{"typeName":"CompetitionActivatedEvent","competitionId":"{id}","competition":{{"id":"{id}","name":"Competition {id}"}}}}"#
                ),
            )
            .await;
        }

        async fn activate_distance(&self, competition: &str, id: &str, discipline: &str, start_mode: i64) {
            self.publish(
                &format!("competition.{competition}.distances.activations"),
                format!(
                    r#"{{"typeName":"DistanceActivatedEvent","competitionId":"{competition}","distanceId":"{id}","distance":{{"id":"{id}","name":"500m","discipline":"{discipline}","startMode":{start_mode}}}}}"#
                ),
            )
            .await;
        }

        async fn activate_heat(&self, competition: &str, distance: &str, group: u32, round: i64, number: i64) {
            self.publish(
                &format!("competition.{competition}.distances.{distance}.heats.activations.{group}"),
                format!(
                    r#"{{"typeName":"HeatActivatedEvent","competitionId":"{competition}","distanceId":"{distance}","heat":{{"round":{round},"number":{number}}}}}"#
                ),
            )
            .await;
        }
    }

    async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out")
            .expect("queue closed")
    }

    async fn next_child<A: Activation, C>(ctx: &mut EntityContext<A, C>) -> C {
        tokio::time::timeout(WAIT, ctx.next_child())
            .await
            .expect("timed out")
            .expect("context closed")
    }

    async fn next_event<A: Activation, C>(ctx: &mut EntityContext<A, C>) -> Raw {
        tokio::time::timeout(WAIT, ctx.next_event())
            .await
            .expect("timed out")
            .expect("context closed")
    }

    async fn assert_closed<A: Activation, C>(ctx: &mut EntityContext<A, C>) {
        assert!(ctx.is_cancelled());
        let event = tokio::time::timeout(WAIT, ctx.next_event()).await.expect("timed out");
        assert!(event.is_none());
        let child = tokio::time::timeout(WAIT, ctx.next_child()).await.expect("timed out");
        assert!(child.is_none());
    }

    async fn eventually_subscribers(broker: &MemoryBroker, subject: &str, expected: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let count = broker.subscriber_count(subject).await;
            if count == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} has {} subscribers, expected {}",
                subject,
                count,
                expected
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_filter_discards_other_competitions() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &["A".to_string()]).await.unwrap();

        h.activate_competition("B").await;
        h.activate_competition("A").await;

        let ctx = recv(&mut rx).await;
        assert_eq!(ctx.key(), "A");
        assert!(tokio::time::timeout(QUIET, rx.recv()).await.is_err());
        assert_eq!(h.broker.subscriber_count("competition.B").await, 0);
    }

    #[tokio::test]
    async fn test_reactivation_supersedes_previous_context() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut first = recv(&mut rx).await;
        h.activate_competition("A").await;
        let mut second = recv(&mut rx).await;

        assert_eq!(first.key(), "A");
        assert_eq!(second.key(), "A");
        assert_closed(&mut first).await;
        assert!(!second.is_cancelled());

        // Only the second context follows distances.
        h.activate_distance("A", "d1", "SpeedSkating.LongTrack.Distance.500", 0).await;
        let distance = next_child(&mut second).await;
        assert_eq!(distance.key(), "d1");
        eventually_subscribers(&h.broker, "competition.A.distances.activations", 1).await;
        eventually_subscribers(&h.broker, "competition.A", 1).await;
    }

    #[tokio::test]
    async fn test_superseded_context_drops_parked_event() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut first = recv(&mut rx).await;
        // Left unread, so it stays parked in the first context's queue.
        h.publish("competition.A", r#"{"typeName":"Stale"}"#.to_string()).await;
        tokio::time::sleep(QUIET).await;

        h.activate_competition("A").await;
        let mut second = recv(&mut rx).await;
        assert_closed(&mut first).await;

        h.publish("competition.A", r#"{"typeName":"Fresh"}"#.to_string()).await;
        // The replacement replays from its own activation, after the stale event.
        assert_eq!(next_event(&mut second).await.type_name, "Fresh");
    }

    #[tokio::test]
    async fn test_unread_events_stall_only_that_competition() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut a = recv(&mut rx).await;
        h.activate_competition("B").await;
        let mut b = recv(&mut rx).await;

        for n in 1..=3 {
            h.publish("competition.A", format!(r#"{{"typeName":"Update","n":{n}}}"#)).await;
        }
        tokio::time::sleep(QUIET).await;
        h.activate_distance("A", "d1", "x", 0).await;

        // A's task is blocked handing over its second event.
        assert!(tokio::time::timeout(QUIET, a.next_child()).await.is_err());

        h.publish("competition.B", r#"{"typeName":"Update"}"#.to_string()).await;
        assert_eq!(next_event(&mut b).await.type_name, "Update");
        h.activate_distance("B", "d1", "x", 0).await;
        assert_eq!(next_child(&mut b).await.key(), "d1");
        h.activate_competition("C").await;
        assert_eq!(recv(&mut rx).await.key(), "C");

        for n in 1..=3 {
            let event = next_event(&mut a).await;
            assert!(event.text.contains(&format!(r#""n":{n}"#)));
        }
        assert_eq!(next_child(&mut a).await.key(), "d1");
    }

    #[tokio::test]
    async fn test_unread_distance_does_not_stall_competition() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut competition = recv(&mut rx).await;
        h.activate_distance("A", "d1", "x", 0).await;
        let mut d1 = next_child(&mut competition).await;

        for n in 1..=3 {
            h.publish("competition.A.distances.d1", format!(r#"{{"typeName":"Update","n":{n}}}"#))
                .await;
        }
        tokio::time::sleep(QUIET).await;

        h.publish("competition.A", r#"{"typeName":"CompetitionUpdatedEvent"}"#.to_string())
            .await;
        assert_eq!(
            next_event(&mut competition).await.type_name,
            "CompetitionUpdatedEvent"
        );
        h.activate_distance("A", "d2", "x", 0).await;
        assert_eq!(next_child(&mut competition).await.key(), "d2");

        for n in 1..=3 {
            let event = next_event(&mut d1).await;
            assert!(event.text.contains(&format!(r#""n":{n}"#)));
        }
    }

    #[tokio::test]
    async fn test_activation_precedes_events() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        h.publish("competition.A", r#"{"typeName":"CompetitionUpdatedEvent"}"#.to_string())
            .await;

        let mut ctx = recv(&mut rx).await;
        assert!(ctx.raw_activation().contains("CompetitionActivatedEvent"));
        assert_eq!(next_event(&mut ctx).await.type_name, "CompetitionUpdatedEvent");
    }

    #[tokio::test]
    async fn test_full_hierarchy_and_heat_events() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut competition = recv(&mut rx).await;
        h.activate_distance("A", "d1", "SpeedSkating.LongTrack.Distance.1000", 0).await;
        let mut distance = next_child(&mut competition).await;
        h.activate_heat("A", "d1", 0, 1, 3).await;
        let mut heat = next_child(&mut distance).await;
        assert_eq!(heat.key(), HeatKey { round: 1, number: 3 });

        h.publish(
            "competition.A.distances.d1.heats.1.3",
            r#"{"typeName":"LapEvent","lap":1}"#.to_string(),
        )
        .await;
        h.publish(
            "competition.A.distances.d1.heats.1.3",
            r#"{"typeName":"LapEvent","lap":2}"#.to_string(),
        )
        .await;
        assert!(next_event(&mut heat).await.text.contains(r#""lap":1"#));
        assert!(next_event(&mut heat).await.text.contains(r#""lap":2"#));

        // Heats never have children.
        let child = tokio::time::timeout(WAIT, heat.next_child()).await.unwrap();
        assert!(child.is_none());
    }

    #[tokio::test]
    async fn test_deactivation_closes_subtree() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut competition = recv(&mut rx).await;
        h.activate_distance("A", "d1", "SpeedSkating.LongTrack.Distance.500", 0).await;
        let mut distance = next_child(&mut competition).await;
        h.activate_heat("A", "d1", 0, 1, 1).await;
        let mut heat = next_child(&mut distance).await;

        h.publish(
            "competition.A.distances.activations",
            r#"{"typeName":"DistanceDeactivatedEvent","competitionId":"A","distanceId":"d1"}"#
                .to_string(),
        )
        .await;

        assert_closed(&mut distance).await;
        assert_closed(&mut heat).await;
        assert!(!competition.is_cancelled());
        eventually_subscribers(&h.broker, "competition.A.distances.d1.heats.activations.0", 0)
            .await;
        eventually_subscribers(&h.broker, "competition.A.distances.d1.heats.1.1", 0).await;
    }

    #[tokio::test]
    async fn test_competition_deactivation_closes_context() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut competition = recv(&mut rx).await;
        h.publish(
            "competition.activations",
            r#"{"typeName":"CompetitionDeactivatedEvent","competitionId":"A"}"#.to_string(),
        )
        .await;

        assert_closed(&mut competition).await;
    }

    #[tokio::test]
    async fn test_paired_distance_merges_both_heat_groups() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut competition = recv(&mut rx).await;
        h.activate_distance("A", "d1", "SpeedSkating.LongTrack.PairsDistance.500", 1).await;
        let mut distance = next_child(&mut competition).await;

        h.activate_heat("A", "d1", 0, 1, 1).await;
        assert_eq!(next_child(&mut distance).await.key(), HeatKey { round: 1, number: 1 });
        h.activate_heat("A", "d1", 1, 1, 2).await;
        assert_eq!(next_child(&mut distance).await.key(), HeatKey { round: 1, number: 2 });
    }

    #[tokio::test]
    async fn test_other_distances_ignore_group_one() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut competition = recv(&mut rx).await;
        h.activate_distance("A", "d2", "SpeedSkating.LongTrack.PairsDistance.500", 0).await;
        let mut distance = next_child(&mut competition).await;

        h.activate_heat("A", "d2", 1, 1, 2).await;
        assert!(tokio::time::timeout(QUIET, distance.next_child()).await.is_err());
        assert_eq!(
            h.broker
                .subscriber_count("competition.A.distances.d2.heats.activations.1")
                .await,
            0
        );

        h.activate_heat("A", "d2", 0, 1, 1).await;
        assert_eq!(next_child(&mut distance).await.key(), HeatKey { round: 1, number: 1 });
    }

    #[tokio::test]
    async fn test_distance_supersession_leaves_siblings_alone() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut competition = recv(&mut rx).await;
        h.activate_distance("A", "d1", "x", 0).await;
        let d1 = next_child(&mut competition).await;
        h.activate_distance("A", "d2", "x", 0).await;
        let mut d2 = next_child(&mut competition).await;
        h.activate_distance("A", "d2", "x", 0).await;
        let d2_again = next_child(&mut competition).await;

        assert!(!d1.is_cancelled());
        assert_closed(&mut d2).await;
        assert!(!d2_again.is_cancelled());
        assert!(!competition.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelling_root_closes_everything() {
        let h = Harness::new();
        let mut rx = h.follower.run(&h.token, DAY, &[]).await.unwrap();

        h.activate_competition("A").await;
        let mut competition = recv(&mut rx).await;
        h.activate_distance("A", "d1", "x", 0).await;
        let mut distance = next_child(&mut competition).await;

        h.token.cancel();
        assert_closed(&mut distance).await;
        assert_closed(&mut competition).await;
        let end = tokio::time::timeout(WAIT, rx.recv()).await.expect("timed out");
        assert!(end.is_none());
        eventually_subscribers(&h.broker, "competition.activations", 0).await;
    }

    #[tokio::test]
    async fn test_run_fails_when_broker_unreachable() {
        let h = Harness::new();
        h.broker.close().await;
        let result = h.follower.run(&h.token, DAY, &[]).await;
        assert!(matches!(
            result,
            Err(crate::source::SourceError::Subscribe {
                source: crate::broker::BrokerError::Unreachable(_),
                ..
            })
        ));
    }
}
