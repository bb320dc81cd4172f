//! Resource usage monitor tests, fed by the pool and the subscription manager

use bulwark::core::{ConnectionPoolManager, PoolConfig};
use bulwark::monitor::{MonitorConfig, ResourceUsageMonitor, Severity, SuggestionCategory};
use bulwark::realtime::{
    subscription_callback, ChangeKind, InMemoryTransport, RealtimeConfig, SubscriptionConfig, SubscriptionManager,
};
use bulwark::ResilienceError;
use std::sync::Arc;
use std::time::Duration;

fn monitor() -> Arc<ResourceUsageMonitor> {
    Arc::new(ResourceUsageMonitor::new(MonitorConfig {
        slow_query_threshold: Duration::from_millis(500),
        max_recommended_subscriptions: 3,
        ..MonitorConfig::default()
    }))
}

#[tokio::test(start_paused = true)]
async fn test_pool_reports_queries_and_connections() {
    let monitor = monitor();
    let pool = ConnectionPoolManager::with_monitor(
        PoolConfig {
            max_connections: 2,
            ..Default::default()
        },
        monitor.clone(),
    )
    .unwrap();

    pool.execute_query(|| async { Ok(()) }, Some("users.list")).await.unwrap();
    pool.execute_query(
        || async {
            tokio::time::sleep(Duration::from_millis(800)).await;
            Ok(())
        },
        Some("reports.build"),
    )
    .await
    .unwrap();
    let _ = pool
        .execute_query(|| async { Err::<(), _>(ResilienceError::operation("syntax error")) }, Some("users.list"))
        .await;

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.queries_total, 3);
    assert_eq!(snapshot.queries_failed, 1);
    assert_eq!(snapshot.slow_queries, 1);
    assert_eq!(snapshot.active_connections, 0);
    assert_eq!(snapshot.peak_connections, 1);
    assert_eq!(snapshot.max_connections, 2);

    let (count, failures, _) = monitor.label_stats("users.list").unwrap();
    assert_eq!((count, failures), (2, 1));

    let suggestions = monitor.optimization_suggestions();
    assert!(suggestions
        .iter()
        .any(|s| s.category == SuggestionCategory::Queries && s.message.contains("reports.build")));
}

#[tokio::test]
async fn test_queue_rejections_are_reported() {
    let monitor = monitor();
    let pool = ConnectionPoolManager::with_monitor(
        PoolConfig {
            max_connections: 1,
            max_queue_size: 0,
            ..Default::default()
        },
        monitor.clone(),
    )
    .unwrap();

    let held = pool.acquire(None).await.unwrap();
    assert!(matches!(
        pool.execute_query(|| async { Ok(()) }, None).await,
        Err(ResilienceError::QueueFull(0))
    ));
    drop(held);

    assert_eq!(monitor.snapshot().queue_rejections, 1);
    let suggestions = monitor.optimization_suggestions();
    assert_eq!(suggestions[0].severity, Severity::High);
    assert_eq!(suggestions[0].category, SuggestionCategory::Connections);
}

#[tokio::test]
async fn test_subscription_manager_reports_counts() {
    let monitor = monitor();
    let transport = Arc::new(InMemoryTransport::new());
    let manager =
        SubscriptionManager::with_monitor(transport.clone(), RealtimeConfig::default(), monitor.clone()).unwrap();

    let ok = subscription_callback(|_| Ok(()));
    let failing = subscription_callback(|_| Err(ResilienceError::operation("bad payload")));
    for id in ["a", "b", "c"] {
        manager
            .subscribe(SubscriptionConfig::new(id, "feed", ok.clone()).batchable(true))
            .await
            .unwrap();
    }
    manager
        .subscribe(SubscriptionConfig::new("d", "alerts", failing))
        .await
        .unwrap();

    transport.publish("feed", ChangeKind::Insert, serde_json::json!({}));
    transport.publish("alerts", ChangeKind::Insert, serde_json::json!({}));

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.active_subscriptions, 4);
    assert_eq!(snapshot.realtime_channels, 2);
    assert_eq!(snapshot.realtime_events, 4);
    assert_eq!(snapshot.callback_errors, 1);

    let categories: Vec<SuggestionCategory> =
        monitor.optimization_suggestions().into_iter().map(|s| s.category).collect();
    assert!(categories.contains(&SuggestionCategory::Subscriptions));
    assert!(categories.contains(&SuggestionCategory::Realtime));

    manager.unsubscribe_all().await;
    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.active_subscriptions, 0);
    assert_eq!(snapshot.peak_subscriptions, 4);
}

#[test]
fn test_exports_carry_the_same_numbers() {
    let monitor = ResourceUsageMonitor::default();
    monitor.record_query("users.list", Duration::from_millis(40), true);
    monitor.record_query("users.list", Duration::from_millis(60), false);
    monitor.set_subscription_counts(2, 1);

    let json = monitor.export_json();
    assert_eq!(json["usage"]["queries_total"], 2);
    assert_eq!(json["usage"]["queries_failed"], 1);
    assert_eq!(json["queries_by_label"]["users.list"]["average_ms"], 50.0);

    let text = monitor.export_prometheus();
    assert!(text.contains("bulwark_queries_total 2"));
    assert!(text.contains("bulwark_queries_failed_total 1"));
    assert!(text.contains("bulwark_active_subscriptions 2"));
    assert!(text.contains("# TYPE bulwark_realtime_channels gauge"));
}
