//! 编排层集成测试：网关 + Butler 队列 + 干预监控，后端由 ScriptedTransport 模拟

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use phoenix::api::{Credentials, MemoryCredentialStore, Method, ScriptedTransport, TransportResponse};
use phoenix::butler::{ActionKind, ButlerEvent, TaskStatus};
use phoenix::config::AppConfig;
use phoenix::core::{ContextBuilder, PhoenixContext, TaskError};
use phoenix::interventions::{InterventionEvent, InterventionStatus};

fn stale_session() -> Arc<MemoryCredentialStore> {
    Arc::new(MemoryCredentialStore::with_credentials(Credentials {
        token: Some("t1".into()),
        refresh_token: Some("r1".into()),
        user_id: Some("u1".into()),
    }))
}

async fn context(transport: &Arc<ScriptedTransport>, config: AppConfig) -> PhoenixContext {
    let ctx = ContextBuilder::new(config)
        .with_transport(Arc::<ScriptedTransport>::clone(transport))
        .with_credential_store(stale_session())
        .build()
        .expect("context");
    assert!(ctx.gateway.restore_session().await.unwrap());
    ctx
}

/// 模拟后端：`hi` 在审批后从 pending 移到 active；旧 token 一律 401
fn intervention_backend(transport: &ScriptedTransport) -> Arc<AtomicBool> {
    let approved = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&approved);
    transport.route(Method::Get, "/phoenix/interventions/pending", move |req| {
        if req.bearer.as_deref() != Some("t2") {
            return Ok(TransportResponse::json(401, &json!({"error": "expired"})));
        }
        let mut list = vec![json!({"_id": "lo", "type": "sleep_intervention", "confidence": 0.5})];
        if !flag.load(Ordering::SeqCst) {
            list.push(json!({"_id": "hi", "type": "burnout_prevention", "confidence": 0.97}));
        }
        Ok(TransportResponse::json(200, &json!({"success": true, "interventions": list})))
    });

    let flag = Arc::clone(&approved);
    transport.route(Method::Get, "/phoenix/interventions/active", move |req| {
        if req.bearer.as_deref() != Some("t2") {
            return Ok(TransportResponse::json(401, &json!({"error": "expired"})));
        }
        if flag.load(Ordering::SeqCst) {
            Ok(TransportResponse::json(200, &json!({"interventions": [
                {"_id": "hi", "type": "burnout_prevention", "confidence": 0.97, "status": "active"}
            ]})))
        } else {
            Ok(TransportResponse::new(404, ""))
        }
    });

    let flag = Arc::clone(&approved);
    transport.route(Method::Post, "/phoenix/interventions/hi/approve", move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(TransportResponse::json(200, &json!({"success": true})))
    });
    transport.route_json(Method::Post, "/auth/refresh", 200, json!({"token": "t2", "refreshToken": "r2"}));

    approved
}

#[tokio::test]
async fn test_poll_refreshes_token_and_auto_approves_once() {
    let transport = Arc::new(ScriptedTransport::new());
    let approved = intervention_backend(&transport);
    let ctx = context(&transport, AppConfig::default()).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _ = ctx.interventions.subscribe(move |e: &InterventionEvent| sink.lock().unwrap().push(e.clone()));

    let report = ctx.interventions.check_now().await.unwrap();
    assert_eq!(report.auto_approved, 1);
    assert!(approved.load(Ordering::SeqCst));

    // 两个并发 401 只触发一次刷新
    assert_eq!(transport.count_for(Method::Post, "/auth/refresh"), 1);
    assert_eq!(ctx.gateway.credentials().await.token.as_deref(), Some("t2"));

    let pending = ctx.interventions.get_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "lo");
    assert_eq!(ctx.interventions.get_active()[0].status, InterventionStatus::Active);

    ctx.interventions.check_now().await.unwrap();
    assert_eq!(transport.count_for(Method::Post, "/phoenix/interventions/hi/approve"), 1);

    let new_pending: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            InterventionEvent::NewPending(i) => Some(i.id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(new_pending, vec!["lo"]);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_polls_until_stopped() {
    let transport = Arc::new(ScriptedTransport::new());
    intervention_backend(&transport);
    let ctx = context(&transport, AppConfig::default()).await;

    ctx.interventions.start(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(65)).await;
    let polls = transport.count_for(Method::Get, "/phoenix/interventions/pending");
    assert!(polls >= 3, "expected at least three polls, saw {}", polls);

    ctx.shutdown();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.count_for(Method::Get, "/phoenix/interventions/pending"), polls);
}

#[tokio::test(start_paused = true)]
async fn test_butler_runs_at_most_three_actions_at_once() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.route_json(Method::Post, "/phoenix/butler/execute", 200, json!({"success": true}));
    transport.set_latency(Some(Duration::from_secs(1)));
    let ctx = context(&transport, AppConfig::default()).await;

    let started = tokio::time::Instant::now();
    let ids: Vec<_> = (0..5)
        .map(|i| ctx.butler.enqueue(ActionKind::UpdateGoal, json!({"goalId": i})))
        .collect();

    let stats = ctx.butler.stats();
    assert_eq!((stats.processing, stats.queued), (3, 2));
    assert_eq!(ctx.butler.get(&ids[4]).unwrap().status, TaskStatus::Queued);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let stats = ctx.butler.stats();
    assert_eq!((stats.processing, stats.queued, stats.completed), (0, 0, 5));

    let requests = transport.requests();
    assert_eq!(requests.len(), 5);
    let late = requests.iter().filter(|r| r.at - started >= Duration::from_secs(1)).count();
    assert_eq!(late, 2);
}

#[tokio::test]
async fn test_butler_failures_are_isolated() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.route_json(Method::Post, "/phoenix/butler/calendar", 422, json!({"error": "conflict"}));
    transport.route_json(Method::Post, "/phoenix/butler/food", 200, json!({"orderId": "o1"}));
    let ctx = context(&transport, AppConfig::default()).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _ = ctx.butler.subscribe(move |e: &ButlerEvent| {
        if matches!(e, ButlerEvent::Completed(_) | ButlerEvent::Failed { .. }) {
            let _ = tx.send(e.clone());
        }
    });

    ctx.butler.enqueue(ActionKind::ScheduleMeeting, json!({"title": "standup"}));
    ctx.butler.enqueue_named("teleport", json!({}));
    ctx.butler.enqueue(ActionKind::OrderMeal, json!({"meal": "salad"}));

    let mut failed = Vec::new();
    let mut completed = Vec::new();
    for _ in 0..3 {
        match rx.recv().await.unwrap() {
            ButlerEvent::Failed { error, .. } => failed.push(error),
            ButlerEvent::Completed(task) => completed.push(task.result),
            _ => unreachable!(),
        }
    }

    assert_eq!(completed, vec![Some(json!({"orderId": "o1"}))]);
    assert_eq!(failed.len(), 2);
    assert!(failed.contains(&TaskError::UnknownTaskType("teleport".into())));
    assert!(failed.iter().any(|e| matches!(e, TaskError::Execution(_))));
    assert_eq!(ctx.butler.stats().failed, 2);
}
