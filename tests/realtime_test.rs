//! Realtime subscription manager tests

use async_trait::async_trait;
use bulwark::realtime::{
    subscription_callback, ActivityLevel, ChangeKind, ChannelHandle, ChannelTopic, EventFilter, EventHandler,
    InMemoryTransport, Priority, RealtimeConfig, RealtimeTransport, SubscriptionCallback, SubscriptionConfig,
    SubscriptionManager,
};
use bulwark::{ResilienceError, ResilienceResult};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<InMemoryTransport>, SubscriptionManager) {
    let transport = Arc::new(InMemoryTransport::new());
    let manager = SubscriptionManager::new(transport.clone(), RealtimeConfig::default()).unwrap();
    (transport, manager)
}

fn counter() -> (Arc<AtomicUsize>, SubscriptionCallback) {
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = hits.clone();
    let callback = subscription_callback(move |_| {
        inner.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (hits, callback)
}

#[tokio::test]
async fn test_duplicate_id_creates_one_channel() {
    let (transport, manager) = setup();
    let (first_hits, first) = counter();
    let (second_hits, second) = counter();

    assert!(manager
        .subscribe(SubscriptionConfig::new("feed", "activities", first))
        .await
        .unwrap());
    assert!(!manager
        .subscribe(SubscriptionConfig::new("feed", "activities", second))
        .await
        .unwrap());

    assert_eq!(transport.channel_count(), 1);
    assert_eq!(transport.opened_total(), 1);
    assert_eq!(manager.get_active_subscription_count(), 1);

    // The replacement callback is the one that fires.
    transport.publish("activities", ChangeKind::Insert, json!({}));
    assert_eq!(first_hits.load(Ordering::SeqCst), 0);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_batchable_subscriptions_get_dedicated_channels() {
    let (transport, manager) = setup();
    let (hits, callback) = counter();

    for id in ["a", "b"] {
        manager
            .subscribe(SubscriptionConfig::new(id, "scores", callback.clone()).event(EventFilter::Update))
            .await
            .unwrap();
    }
    assert_eq!(transport.channel_count(), 2);

    transport.publish("scores", ChangeKind::Update, json!({"score": 10}));
    transport.publish("scores", ChangeKind::Insert, json!({"score": 11}));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_batching_disabled_never_shares() {
    let transport = Arc::new(InMemoryTransport::new());
    let manager = SubscriptionManager::new(
        transport.clone(),
        RealtimeConfig {
            batching_enabled: false,
            ..RealtimeConfig::default()
        },
    )
    .unwrap();
    let (_, callback) = counter();

    for id in ["a", "b"] {
        manager
            .subscribe(SubscriptionConfig::new(id, "scores", callback.clone()).batchable(true))
            .await
            .unwrap();
    }
    assert_eq!(transport.channel_count(), 2);
}

#[tokio::test]
async fn test_unsubscribe_unknown_id_is_noop() {
    let (transport, manager) = setup();
    let (_, callback) = counter();
    manager
        .subscribe(SubscriptionConfig::new("a", "t", callback))
        .await
        .unwrap();

    assert!(!manager.unsubscribe("missing").await);
    assert_eq!(manager.get_active_subscription_count(), 1);
    assert_eq!(transport.channel_count(), 1);
}

#[tokio::test]
async fn test_unsubscribe_all_clears_everything() {
    let (transport, manager) = setup();
    let (_, callback) = counter();

    for (id, table) in [("a", "t1"), ("b", "t1"), ("c", "t2")] {
        manager
            .subscribe(SubscriptionConfig::new(id, table, callback.clone()).batchable(true))
            .await
            .unwrap();
    }
    assert_eq!(manager.get_active_subscription_count(), 3);
    assert_eq!(transport.channel_count(), 2);

    assert_eq!(manager.unsubscribe_all().await, 3);
    assert_eq!(manager.get_active_subscription_count(), 0);
    assert_eq!(manager.channel_count(), 0);
    assert_eq!(transport.channel_count(), 0);

    // The manager stays usable.
    manager
        .subscribe(SubscriptionConfig::new("d", "t1", callback))
        .await
        .unwrap();
    assert_eq!(manager.get_active_subscription_count(), 1);
}

#[tokio::test]
async fn test_activity_levels_suspend_by_priority() {
    let (transport, manager) = setup();
    let (high_hits, high) = counter();
    let (medium_hits, medium) = counter();
    let (low_hits, low) = counter();

    manager
        .subscribe(SubscriptionConfig::new("high", "t", high).priority(Priority::High))
        .await
        .unwrap();
    manager
        .subscribe(SubscriptionConfig::new("medium", "t", medium).priority(Priority::Medium))
        .await
        .unwrap();
    manager
        .subscribe(SubscriptionConfig::new("low", "t", low).priority(Priority::Low))
        .await
        .unwrap();
    assert_eq!(transport.channel_count(), 3);

    manager.set_background_mode().await;
    assert_eq!(manager.activity_level(), ActivityLevel::Background);
    assert_eq!(manager.get_active_subscription_count(), 2);
    assert_eq!(transport.channel_count(), 2);

    manager.set_inactive_mode().await;
    assert_eq!(manager.get_active_subscription_count(), 1);
    assert_eq!(transport.channel_count(), 1);
    let active: Vec<String> = manager.get_active_subscriptions().into_iter().map(|s| s.id).collect();
    assert_eq!(active, vec!["high".to_string()]);

    transport.publish("t", ChangeKind::Delete, json!({}));
    assert_eq!(high_hits.load(Ordering::SeqCst), 1);
    assert_eq!(medium_hits.load(Ordering::SeqCst), 0);
    assert_eq!(low_hits.load(Ordering::SeqCst), 0);

    manager.update_user_activity().await;
    assert_eq!(manager.activity_level(), ActivityLevel::Active);
    assert_eq!(manager.get_active_subscription_count(), 3);
    assert_eq!(transport.channel_count(), 3);
    assert_eq!(manager.subscription_count(), 3);

    transport.publish("t", ChangeKind::Delete, json!({}));
    assert_eq!(high_hits.load(Ordering::SeqCst), 2);
    assert_eq!(medium_hits.load(Ordering::SeqCst), 1);
    assert_eq!(low_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscribe_while_inactive_starts_suspended() {
    let (transport, manager) = setup();
    manager.set_inactive_mode().await;
    let (_, callback) = counter();

    manager
        .subscribe(SubscriptionConfig::new("low", "t", callback).priority(Priority::Low))
        .await
        .unwrap();
    assert_eq!(manager.subscription_count(), 1);
    assert_eq!(manager.get_active_subscription_count(), 0);
    assert_eq!(transport.channel_count(), 0);

    // Removing a suspended subscription must not touch the transport.
    assert!(manager.unsubscribe("low").await);
    assert_eq!(manager.subscription_count(), 0);
}

#[tokio::test]
async fn test_shared_channel_survives_partial_suspension() {
    let (transport, manager) = setup();
    let (high_hits, high) = counter();
    let (low_hits, low) = counter();

    manager
        .subscribe(
            SubscriptionConfig::new("high", "feed", high)
                .priority(Priority::High)
                .batchable(true),
        )
        .await
        .unwrap();
    manager
        .subscribe(
            SubscriptionConfig::new("low", "feed", low)
                .priority(Priority::Low)
                .batchable(true),
        )
        .await
        .unwrap();
    assert_eq!(transport.channel_count(), 1);

    manager.set_background_mode().await;
    assert_eq!(transport.channel_count(), 1);

    transport.publish("feed", ChangeKind::Insert, json!({}));
    assert_eq!(high_hits.load(Ordering::SeqCst), 1);
    assert_eq!(low_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failing_callback_does_not_affect_others() {
    let (transport, manager) = setup();
    let (hits, good) = counter();
    let failing = subscription_callback(|_| Err(ResilienceError::operation("render failed")));

    manager
        .subscribe(SubscriptionConfig::new("failing", "t", failing).batchable(true))
        .await
        .unwrap();
    manager
        .subscribe(SubscriptionConfig::new("good", "t", good).batchable(true))
        .await
        .unwrap();

    for _ in 0..3 {
        transport.publish("t", ChangeKind::Insert, json!({}));
    }

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(manager.get_active_subscription_count(), 2);

    let metrics = manager.get_metrics();
    assert_eq!(metrics.events_delivered, 6);
    assert_eq!(metrics.callback_errors, 3);
    let failing = metrics.subscriptions.iter().find(|s| s.id == "failing").unwrap();
    assert_eq!(failing.callback_errors, 3);
}

#[tokio::test]
async fn test_subscription_records_are_observable() {
    let (_, manager) = setup();
    let (_, callback) = counter();

    manager
        .subscribe(
            SubscriptionConfig::new("leaderboard", "scores", callback)
                .priority(Priority::High)
                .event(EventFilter::Update),
        )
        .await
        .unwrap();

    let records = manager.get_active_subscriptions();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.id, "leaderboard");
    assert_eq!(record.table, "scores");
    assert_eq!(record.priority, Priority::High);
    assert!(record.created_at <= chrono::Utc::now());
    assert_eq!(record.channel, "realtime:scores:update#leaderboard");

    let json = serde_json::to_value(manager.get_metrics()).unwrap();
    assert_eq!(json["subscriptions"][0]["priority"], "high");
    assert_eq!(json["activity_level"], "active");
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_monitor_demotes_level() {
    let transport = Arc::new(InMemoryTransport::new());
    let manager = SubscriptionManager::new(
        transport.clone(),
        RealtimeConfig {
            inactivity_timeout: Duration::from_secs(120),
            activity_check_interval: Duration::from_secs(30),
            ..RealtimeConfig::default()
        },
    )
    .unwrap();
    let (_, callback) = counter();
    manager
        .subscribe(SubscriptionConfig::new("low", "t", callback).priority(Priority::Low))
        .await
        .unwrap();

    assert!(manager.start_activity_monitor());
    assert!(!manager.start_activity_monitor());

    tokio::time::sleep(Duration::from_secs(100)).await;
    manager.update_user_activity().await;
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(manager.activity_level(), ActivityLevel::Active);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(manager.activity_level(), ActivityLevel::Inactive);
    assert_eq!(transport.channel_count(), 0);

    manager.destroy().await;
}

#[tokio::test]
async fn test_destroy_twice_is_noop() {
    let (transport, manager) = setup();
    let (_, callback) = counter();
    manager
        .subscribe(SubscriptionConfig::new("a", "t", callback.clone()))
        .await
        .unwrap();
    manager.start_activity_monitor();
    assert_eq!(manager.active_task_count(), 1);

    manager.destroy().await;
    manager.destroy().await;

    assert_eq!(manager.active_task_count(), 0);
    assert_eq!(manager.get_active_subscription_count(), 0);
    assert_eq!(transport.channel_count(), 0);
    assert!(!manager.start_activity_monitor());

    let err = manager
        .subscribe(SubscriptionConfig::new("b", "t", callback))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::Shutdown));
    assert!(!manager.get_health_status().is_healthy);
}

#[tokio::test]
async fn test_health_flags_subscription_pressure() {
    let transport = Arc::new(InMemoryTransport::new());
    let manager = SubscriptionManager::new(
        transport,
        RealtimeConfig {
            max_subscriptions: 2,
            ..RealtimeConfig::default()
        },
    )
    .unwrap();
    assert!(manager.get_health_status().is_healthy);

    let (_, callback) = counter();
    for id in ["a", "b"] {
        manager
            .subscribe(SubscriptionConfig::new(id, "t", callback.clone()))
            .await
            .unwrap();
    }

    let health = manager.get_health_status();
    assert!(!health.is_healthy);
    assert!(health.issues[0].contains("near limit"));
}

/// Transport whose channel opens fail while `failures` is non-zero
struct FlakyTransport {
    inner: InMemoryTransport,
    failures: AtomicUsize,
}

#[async_trait]
impl RealtimeTransport for FlakyTransport {
    async fn subscribe(&self, topic: &ChannelTopic, handler: EventHandler) -> ResilienceResult<ChannelHandle> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ResilienceError::Transport("socket closed".to_string()));
        }
        self.inner.subscribe(topic, handler).await
    }

    async fn unsubscribe(&self, handle: ChannelHandle) -> ResilienceResult<()> {
        self.inner.unsubscribe(handle).await
    }
}

#[tokio::test]
async fn test_failed_resume_is_retried_on_next_activity_update() {
    let transport = Arc::new(FlakyTransport {
        inner: InMemoryTransport::new(),
        failures: AtomicUsize::new(0),
    });
    let manager = SubscriptionManager::new(transport.clone(), RealtimeConfig::default()).unwrap();
    let (hits, callback) = counter();

    manager
        .subscribe(SubscriptionConfig::new("feed", "posts", callback))
        .await
        .unwrap();
    manager.set_inactive_mode().await;
    assert_eq!(manager.get_active_subscription_count(), 0);

    transport.failures.store(1, Ordering::SeqCst);
    manager.update_user_activity().await;
    assert_eq!(manager.activity_level(), ActivityLevel::Active);
    assert_eq!(manager.get_active_subscription_count(), 0);

    manager.update_user_activity().await;
    assert_eq!(manager.get_active_subscription_count(), 1);
    assert_eq!(transport.inner.channel_count(), 1);

    transport.inner.publish("posts", ChangeKind::Insert, json!({}));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
