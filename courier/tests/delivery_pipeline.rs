use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use courier::database::models::{
    ChannelStatus, HistoryStatus, QueueState, UserChannelPreferenceDbModel, UserDbModel,
};
use courier::database::repositories::{
    RecipientDirectory, SettingsRepository, SqlxRecipientDirectory, SqlxSettingsRepository,
};
use courier::database::time::{DAY_MS, now_ms};
use courier::database::{DbPool, init_memory_pool};
use courier::notification::{
    DeliveryEvent, DeliveryPipeline, DeliveryWorker, FAILURE_THRESHOLD, HistoryQuery,
    NewNotification, NotificationChannel, OutboundMessage, RecipientResolver, Variables,
};
use courier::{DeliveryError, Error};

/// Channel whose outcomes are scripted per call; succeeds once the script
/// runs out.
struct ScriptedChannel {
    channel_type: &'static str,
    script: Mutex<VecDeque<Result<(), String>>>,
    delay: Option<Duration>,
    sent: Mutex<Vec<(String, String)>>,
}

impl ScriptedChannel {
    fn new(channel_type: &'static str) -> Arc<Self> {
        Self::with_script(channel_type, Vec::new())
    }

    fn with_script(channel_type: &'static str, script: Vec<Result<(), String>>) -> Arc<Self> {
        Arc::new(Self {
            channel_type,
            script: Mutex::new(script.into()),
            delay: None,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn slow(channel_type: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            channel_type,
            script: Mutex::new(VecDeque::new()),
            delay: Some(delay),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn fail_next(&self, times: usize) {
        let mut script = self.script.lock();
        for _ in 0..times {
            script.push_back(Err("upstream refused".to_string()));
        }
    }

    fn sent_subjects(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    fn sent_recipients(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(r, _)| r.clone()).collect()
    }
}

#[async_trait]
impl NotificationChannel for ScriptedChannel {
    fn channel_type(&self) -> &str {
        self.channel_type
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, recipient: &str, message: &OutboundMessage) -> courier::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front().unwrap_or(Ok(()));
        match next {
            Ok(()) => {
                self.sent
                    .lock()
                    .push((recipient.to_string(), message.subject.clone()));
                Ok(())
            }
            Err(msg) => Err(DeliveryError::send(msg).into()),
        }
    }

    fn validate_config(&self, _config: &Value) -> courier::Result<()> {
        Ok(())
    }
}

async fn setup_pool() -> DbPool {
    init_memory_pool().await.unwrap()
}

async fn pipeline_with(pool: &DbPool, settings: &[(&str, &str)]) -> DeliveryPipeline {
    let repo = SqlxSettingsRepository::new(pool.clone());
    for (key, value) in settings {
        repo.set(key, value).await.unwrap();
    }
    let pipeline = DeliveryPipeline::from_pool(pool.clone()).await.unwrap();
    pipeline.start().await.unwrap();
    pipeline
}

/// Register `channel` under its type and enable it.
async fn install(pipeline: &DeliveryPipeline, channel: Arc<ScriptedChannel>) {
    let channel_type = channel.channel_type;
    pipeline.manager.register_implementation(channel);
    pipeline.manager.enable(channel_type).await.unwrap();
}

/// Run one tick and wait for every dispatched entry.
async fn tick(pipeline: &DeliveryPipeline) -> Vec<String> {
    let batch = pipeline.worker.process_queue().await.unwrap();
    let ids = batch.entry_ids().to_vec();
    batch.wait().await;
    ids
}

/// Make every scheduled retry due now.
async fn make_retries_due(pool: &DbPool) {
    sqlx::query("UPDATE notification_queue SET next_retry_at = 0 WHERE next_retry_at IS NOT NULL")
        .execute(pool)
        .await
        .unwrap();
}

fn to(recipient: &str) -> Variables {
    Variables::new().with("recipient", recipient)
}

async fn enqueue(pipeline: &DeliveryPipeline, channel_type: &str, subject: &str) -> String {
    pipeline
        .queue
        .enqueue(None, channel_type, subject, "body", 0, to("+15550100"))
        .await
        .unwrap()
}

#[tokio::test]
async fn delivers_and_records_history() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[]).await;
    let sms = ScriptedChannel::new("sms");
    install(&pipeline, Arc::clone(&sms)).await;
    let mut events = pipeline.worker.subscribe();

    let id = pipeline
        .queue
        .enqueue(
            None,
            "sms",
            "Storm warning for {{ city }}",
            "Wind {{speed}} km/h",
            0,
            to("+15550100").with("city", "Oslo").with("speed", 90),
        )
        .await
        .unwrap();

    let dispatched = tick(&pipeline).await;
    assert_eq!(dispatched, vec![id.clone()]);

    let entry = pipeline.queue.get_entry(&id).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Delivered));
    assert!(entry.delivered_at.is_some());
    assert_eq!(entry.retry_count, 0);

    assert_eq!(sms.sent_recipients(), vec!["+15550100".to_string()]);
    assert_eq!(
        sms.sent_subjects(),
        vec!["Storm warning for Oslo".to_string()]
    );

    let history = pipeline.history.for_entry(&id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, HistoryStatus::Delivered.as_str());
    assert_eq!(history[0].body, "Wind 90 km/h");

    let event = events.recv().await.unwrap();
    assert!(matches!(event, DeliveryEvent::Delivered { .. }));
    assert_eq!(event.entry_id(), id);

    let stats = pipeline.manager.stats("sms").await.unwrap();
    assert!(stats.last_success_at.is_some());
    assert_eq!(stats.failure_count, 0);
}

#[tokio::test]
async fn higher_priority_is_claimed_first() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[("notifications.batch_size", "1")]).await;
    let sms = ScriptedChannel::new("sms");
    install(&pipeline, Arc::clone(&sms)).await;

    let low = pipeline
        .queue
        .submit(
            NewNotification::new("sms", "low", "b")
                .priority(1)
                .variables(to("+1")),
        )
        .await
        .unwrap();
    let high = pipeline
        .queue
        .submit(
            NewNotification::new("sms", "high", "b")
                .priority(10)
                .variables(to("+1")),
        )
        .await
        .unwrap();
    let templated = pipeline
        .queue
        .enqueue_with_template("digest", None, "sms", "templated", "b", 5, to("+1"))
        .await
        .unwrap();
    let stored = pipeline.queue.get_entry(&templated).await.unwrap();
    assert_eq!(stored.template_id.as_deref(), Some("digest"));
    assert_eq!(stored.priority, 5);

    assert_eq!(tick(&pipeline).await, vec![high]);
    assert_eq!(tick(&pipeline).await, vec![templated]);
    assert_eq!(tick(&pipeline).await, vec![low]);
    assert!(tick(&pipeline).await.is_empty());
    assert_eq!(sms.sent_subjects(), vec!["high", "templated", "low"]);
}

#[tokio::test]
async fn exhausted_retries_end_in_dead_letter() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[("notifications.retry_max", "3")]).await;
    let sms = ScriptedChannel::new("sms");
    sms.fail_next(3);
    install(&pipeline, Arc::clone(&sms)).await;
    let mut events = pipeline.worker.subscribe();

    let id = enqueue(&pipeline, "sms", "retry me").await;
    assert_eq!(
        pipeline.queue.get_entry(&id).await.unwrap().queue_state(),
        Some(QueueState::Created)
    );

    for expected_retry in 1..=2 {
        assert_eq!(tick(&pipeline).await, vec![id.clone()]);
        let entry = pipeline.queue.get_entry(&id).await.unwrap();
        assert_eq!(entry.queue_state(), Some(QueueState::Failed));
        assert_eq!(entry.retry_count, expected_retry);
        let next_retry_at = entry.next_retry_at.expect("retry scheduled");
        assert!(next_retry_at > entry.updated_at);
        assert_eq!(entry.error_message.as_deref(), Some("upstream refused"));

        // Not due yet.
        assert!(tick(&pipeline).await.is_empty());
        make_retries_due(&pool).await;
    }

    assert_eq!(tick(&pipeline).await, vec![id.clone()]);
    let entry = pipeline.queue.get_entry(&id).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::DeadLetter));
    assert_eq!(entry.retry_count, entry.max_retries);
    assert_eq!(entry.retry_count, 3);
    assert!(entry.next_retry_at.is_none());
    assert!(entry.failed_at.is_some());
    assert!(entry.error_message.is_some());

    // Terminal: never claimed again.
    make_retries_due(&pool).await;
    assert!(tick(&pipeline).await.is_empty());

    let statuses: Vec<String> = pipeline
        .history
        .for_entry(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(statuses, vec!["failed", "failed", "dead_letter"]);

    let mut retries_scheduled = 0;
    let mut dead_lettered = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            DeliveryEvent::RetryScheduled { .. } => retries_scheduled += 1,
            DeliveryEvent::DeadLettered { retry_count, .. } => {
                assert_eq!(retry_count, 3);
                dead_lettered += 1;
            }
            DeliveryEvent::Delivered { .. } => panic!("unexpected delivery"),
        }
    }
    assert_eq!(retries_scheduled, 2);
    assert_eq!(dead_lettered, 1);

    let stats = pipeline.queue.queue_stats().await.unwrap();
    assert_eq!(stats.dead_letters, 1);
    assert_eq!(stats.by_state[&QueueState::DeadLetter], 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn requeue_resets_dead_letters_and_is_idempotent() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[("notifications.retry_max", "1")]).await;
    let sms = ScriptedChannel::new("sms");
    sms.fail_next(1);
    install(&pipeline, Arc::clone(&sms)).await;

    let dead = enqueue(&pipeline, "sms", "first").await;
    tick(&pipeline).await;
    let delivered = enqueue(&pipeline, "sms", "second").await;
    tick(&pipeline).await;

    assert_eq!(
        pipeline.queue.get_entry(&dead).await.unwrap().queue_state(),
        Some(QueueState::DeadLetter)
    );
    let listed = pipeline.queue.list_dead_letters(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, dead);

    let ids = vec![dead.clone(), delivered.clone(), "missing".to_string()];
    assert_eq!(pipeline.queue.requeue_dead_letters(&ids).await.unwrap(), 1);
    assert_eq!(pipeline.queue.requeue_dead_letters(&ids).await.unwrap(), 0);

    let entry = pipeline.queue.get_entry(&dead).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Queued));
    assert_eq!(entry.retry_count, 0);
    assert!(entry.next_retry_at.is_none());
    assert!(entry.error_message.is_none());
    assert_eq!(
        pipeline
            .queue
            .get_entry(&delivered)
            .await
            .unwrap()
            .queue_state(),
        Some(QueueState::Delivered)
    );

    assert_eq!(tick(&pipeline).await, vec![dead.clone()]);
    assert_eq!(
        pipeline.queue.get_entry(&dead).await.unwrap().queue_state(),
        Some(QueueState::Delivered)
    );
}

#[tokio::test]
async fn cleanup_delivered_respects_retention() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[]).await;
    install(&pipeline, ScriptedChannel::new("sms")).await;

    let old = enqueue(&pipeline, "sms", "old").await;
    let fresh = enqueue(&pipeline, "sms", "fresh").await;
    let waiting = enqueue(&pipeline, "sms", "waiting").await;
    sqlx::query("UPDATE notification_queue SET next_retry_at = ? WHERE id = ?")
        .bind(now_ms() + DAY_MS)
        .bind(&waiting)
        .execute(&pool)
        .await
        .unwrap();
    tick(&pipeline).await;

    sqlx::query("UPDATE notification_queue SET delivered_at = ? WHERE id = ?")
        .bind(now_ms() - 40 * DAY_MS)
        .bind(&old)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(pipeline.queue.cleanup_delivered(30).await.unwrap(), 1);
    assert!(matches!(
        pipeline.queue.get_entry(&old).await,
        Err(Error::NotFound { .. })
    ));
    assert!(pipeline.queue.get_entry(&fresh).await.is_ok());
    assert!(pipeline.queue.get_entry(&waiting).await.is_ok());
}

#[tokio::test]
async fn failure_threshold_trips_and_one_success_clears() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(
        &pool,
        &[
            ("notifications.retry_max", "1"),
            ("notifications.batch_size", "1"),
        ],
    )
    .await;
    let sms = ScriptedChannel::new("sms");
    sms.fail_next(FAILURE_THRESHOLD as usize);
    install(&pipeline, Arc::clone(&sms)).await;

    for attempt in 1..FAILURE_THRESHOLD {
        enqueue(&pipeline, "sms", "x").await;
        tick(&pipeline).await;
        let stats = pipeline.manager.stats("sms").await.unwrap();
        assert_eq!(stats.failure_count, attempt);
        assert_eq!(stats.state, ChannelStatus::Enabled);
    }

    enqueue(&pipeline, "sms", "x").await;
    tick(&pipeline).await;
    let stats = pipeline.manager.stats("sms").await.unwrap();
    assert_eq!(stats.failure_count, FAILURE_THRESHOLD);
    assert_eq!(stats.state, ChannelStatus::Failed);
    assert_eq!(stats.last_error.as_deref(), Some("upstream refused"));

    // A tripped channel still receives deliveries; one success clears it.
    enqueue(&pipeline, "sms", "x").await;
    tick(&pipeline).await;
    let stats = pipeline.manager.stats("sms").await.unwrap();
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.state, ChannelStatus::Enabled);
    assert!(stats.last_success_at.is_some());
}

#[tokio::test]
async fn disabled_and_unknown_channels_fail_with_their_kind() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[("notifications.retry_max", "2")]).await;
    // Registered but never enabled.
    pipeline
        .manager
        .register_implementation(ScriptedChannel::new("sms"));

    let disabled = enqueue(&pipeline, "sms", "x").await;
    let unknown = enqueue(&pipeline, "carrier_pigeon", "x").await;
    tick(&pipeline).await;

    let entry = pipeline.queue.get_entry(&disabled).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Failed));
    assert_eq!(entry.retry_count, 1);
    assert_eq!(
        entry.error_message.as_deref(),
        Some(
            DeliveryError::ChannelDisabled("sms".to_string())
                .to_string()
                .as_str()
        )
    );

    let entry = pipeline.queue.get_entry(&unknown).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Failed));
    assert_eq!(
        entry.error_message.as_deref(),
        Some(
            DeliveryError::ChannelNotFound("carrier_pigeon".to_string())
                .to_string()
                .as_str()
        )
    );

    let mut kinds = Vec::new();
    for id in [&disabled, &unknown] {
        let records = pipeline.history.for_entry(id).await.unwrap();
        kinds.push(records[0].metadata().error_kind);
    }
    assert_eq!(
        kinds,
        vec![
            Some("channel_disabled".to_string()),
            Some("channel_not_found".to_string())
        ]
    );
}

#[tokio::test]
async fn missing_recipient_consumes_a_retry() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[]).await;
    install(&pipeline, ScriptedChannel::new("sms")).await;

    let id = pipeline
        .queue
        .enqueue(None, "sms", "x", "y", 0, Variables::new())
        .await
        .unwrap();
    tick(&pipeline).await;

    let entry = pipeline.queue.get_entry(&id).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Failed));
    assert_eq!(entry.retry_count, 1);
    let record = &pipeline.history.for_entry(&id).await.unwrap()[0];
    assert_eq!(
        record.metadata().error_kind.as_deref(),
        Some("recipient_unresolved")
    );
}

#[tokio::test]
async fn slow_channel_times_out() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[("notifications.send_timeout_secs", "1")]).await;
    install(
        &pipeline,
        ScriptedChannel::slow("sms", Duration::from_secs(5)),
    )
    .await;

    let id = enqueue(&pipeline, "sms", "x").await;
    tick(&pipeline).await;

    let entry = pipeline.queue.get_entry(&id).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Failed));
    let record = &pipeline.history.for_entry(&id).await.unwrap()[0];
    assert_eq!(record.metadata().error_kind.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn outcome_is_dropped_when_entry_leaves_sending() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[]).await;
    let sms = ScriptedChannel::slow("sms", Duration::from_millis(300));
    install(&pipeline, Arc::clone(&sms)).await;
    let mut events = pipeline.worker.subscribe();

    let id = enqueue(&pipeline, "sms", "x").await;
    let batch = pipeline.worker.process_queue().await.unwrap();
    assert_eq!(batch.len(), 1);

    // Moved away while the send is in flight.
    sqlx::query("UPDATE notification_queue SET state = 'queued' WHERE id = ?")
        .bind(&id)
        .execute(&pool)
        .await
        .unwrap();
    batch.wait().await;

    assert_eq!(sms.sent_subjects(), vec!["x"]);
    let entry = pipeline.queue.get_entry(&id).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Queued));
    assert!(pipeline.history.for_entry(&id).await.unwrap().is_empty());
    assert!(events.try_recv().is_err());
    let stats = pipeline.manager.stats("sms").await.unwrap();
    assert!(stats.last_success_at.is_none());
}

#[tokio::test]
async fn recipient_resolution_order() {
    let pool = setup_pool().await;
    let directory = Arc::new(SqlxRecipientDirectory::new(pool.clone()));
    directory
        .upsert_user(&UserDbModel::new(
            "u1",
            Some("primary@example.com".to_string()),
        ))
        .await
        .unwrap();
    directory
        .upsert_preference(&UserChannelPreferenceDbModel::new(
            "u1",
            "sms",
            "+4790000000",
            true,
        ))
        .await
        .unwrap();
    directory
        .upsert_preference(&UserChannelPreferenceDbModel::new(
            "u1",
            "email",
            "alerts@example.com",
            false,
        ))
        .await
        .unwrap();
    let resolver = RecipientResolver::new(directory.clone());
    let vars = to("fallback@example.com");

    // Enabled preference wins over the variable.
    assert_eq!(
        resolver.resolve(Some("u1"), "sms", &vars).await.unwrap(),
        "+4790000000"
    );
    // Disabled preference falls through to the primary email.
    assert_eq!(
        resolver.resolve(Some("u1"), "email", &vars).await.unwrap(),
        "primary@example.com"
    );
    // Primary email only applies to the email channel.
    assert_eq!(
        resolver
            .resolve(Some("u1"), "discord", &vars)
            .await
            .unwrap(),
        "fallback@example.com"
    );
    // Unknown users and anonymous entries use the variable.
    assert_eq!(
        resolver
            .resolve(Some("ghost"), "email", &vars)
            .await
            .unwrap(),
        "fallback@example.com"
    );
    assert_eq!(
        resolver.resolve(None, "email", &vars).await.unwrap(),
        "fallback@example.com"
    );

    let err = resolver
        .resolve(None, "email", &Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Delivery(DeliveryError::RecipientUnresolved { .. })
    ));
}

#[tokio::test]
async fn worker_uses_directory_address_for_user_entries() {
    let pool = setup_pool().await;
    let directory = SqlxRecipientDirectory::new(pool.clone());
    directory
        .upsert_user(&UserDbModel::new("u1", None))
        .await
        .unwrap();
    directory
        .upsert_preference(&UserChannelPreferenceDbModel::new(
            "u1",
            "sms",
            "+4791111111",
            true,
        ))
        .await
        .unwrap();

    let pipeline = pipeline_with(&pool, &[]).await;
    let sms = ScriptedChannel::new("sms");
    install(&pipeline, Arc::clone(&sms)).await;

    pipeline
        .queue
        .submit(
            NewNotification::new("sms", "hi", "there")
                .user("u1")
                .variables(to("+1")),
        )
        .await
        .unwrap();
    tick(&pipeline).await;

    assert_eq!(sms.sent_recipients(), vec!["+4791111111".to_string()]);
}

/// Directory whose backing store is down.
struct UnavailableDirectory;

#[async_trait]
impl RecipientDirectory for UnavailableDirectory {
    async fn channel_preference(
        &self,
        _user_id: &str,
        _channel_type: &str,
    ) -> courier::Result<Option<UserChannelPreferenceDbModel>> {
        Err(Error::Database("store unavailable".to_string()))
    }

    async fn primary_email(&self, _user_id: &str) -> courier::Result<Option<String>> {
        Err(Error::Database("store unavailable".to_string()))
    }
}

#[tokio::test]
async fn store_outage_releases_entry_without_spending_retries() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[]).await;
    let sms = ScriptedChannel::new("sms");
    install(&pipeline, Arc::clone(&sms)).await;

    let outage_worker = Arc::new(DeliveryWorker::new(
        Arc::clone(&pipeline.queue),
        Arc::clone(&pipeline.manager),
        Arc::clone(&pipeline.history),
        Arc::new(RecipientResolver::new(Arc::new(UnavailableDirectory))),
        Arc::clone(&pipeline.policy),
    ));
    let mut events = outage_worker.subscribe();

    let id = pipeline
        .queue
        .submit(
            NewNotification::new("sms", "hi", "there")
                .user("u1")
                .variables(to("+1")),
        )
        .await
        .unwrap();

    for _ in 0..3 {
        let batch = outage_worker.process_queue().await.unwrap();
        assert_eq!(batch.entry_ids().to_vec(), vec![id.clone()]);
        batch.wait().await;
    }

    let entry = pipeline.queue.get_entry(&id).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Queued));
    assert_eq!(entry.retry_count, 0);
    assert!(entry.error_message.is_none());
    assert!(events.try_recv().is_err());
    assert!(sms.sent_subjects().is_empty());

    let stats = pipeline.manager.stats("sms").await.unwrap();
    assert_eq!(stats.state, ChannelStatus::Enabled);
    assert_eq!(stats.failure_count, 0);

    let history = pipeline
        .history
        .list(&HistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(history.total, 0);

    // With the store back the entry goes out on the next tick.
    assert_eq!(tick(&pipeline).await, vec![id.clone()]);
    assert_eq!(sms.sent_recipients(), vec!["+1".to_string()]);
    let entry = pipeline.queue.get_entry(&id).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Delivered));
    assert_eq!(entry.retry_count, 0);
}

#[tokio::test]
async fn history_pagination_and_filters() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[("notifications.retry_max", "1")]).await;
    let sms = ScriptedChannel::new("sms");
    sms.fail_next(2);
    install(&pipeline, Arc::clone(&sms)).await;

    for i in 0..5 {
        enqueue(&pipeline, "sms", &format!("m{i}")).await;
        tick(&pipeline).await;
    }

    let page = pipeline
        .history
        .list(&HistoryQuery {
            page: 1,
            per_page: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.records.len(), 2);
    // Newest first.
    assert_eq!(page.records[0].subject, "m4");
    assert_eq!(page.records[1].subject, "m3");

    let last = pipeline
        .history
        .list(&HistoryQuery {
            page: 3,
            per_page: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(last.records.len(), 1);
    assert_eq!(last.records[0].subject, "m0");

    let dead = pipeline
        .history
        .list(&HistoryQuery {
            status: Some(HistoryStatus::DeadLetter),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(dead.total, 2);

    let other_channel = pipeline
        .history
        .list(&HistoryQuery {
            channel_type: Some("email".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(other_channel.total, 0);
    assert!(other_channel.records.is_empty());
}

#[tokio::test]
async fn configure_validates_and_registers() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[]).await;

    let err = pipeline
        .manager
        .configure("discord", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(!pipeline.manager.registry().contains("discord"));

    let err = pipeline
        .manager
        .configure("fax", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let stored = pipeline
        .manager
        .configure(
            "webhook",
            &json!({ "url": "https://hooks.example.com/notify" }),
        )
        .await
        .unwrap();
    assert_eq!(stored["method"], "POST");
    assert_eq!(stored["timeout_secs"], 30);
    assert!(pipeline.manager.registry().contains("webhook"));

    // A fresh manager rebuilds the implementation from the stored config.
    let restarted = pipeline_with(&pool, &[]).await;
    assert!(restarted.manager.registry().contains("webhook"));
    assert!(!restarted.manager.registry().contains("discord"));
}

#[tokio::test]
async fn initialize_channels_is_idempotent() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[]).await;

    assert_eq!(pipeline.manager.initialize_channels().await.unwrap(), 0);

    let channels = pipeline.manager.list_channels().await.unwrap();
    assert_eq!(
        channels.len(),
        pipeline.manager.catalog().definitions().len()
    );
    for overview in &channels {
        let stats = overview.stats.as_ref().expect("state row seeded");
        assert!(!stats.enabled);
        assert_eq!(stats.state, ChannelStatus::Disabled);
        assert!(!overview.registered);
    }

    pipeline.manager.enable("email").await.unwrap();
    assert!(pipeline.manager.stats("email").await.unwrap().enabled);
    pipeline.manager.disable("email").await.unwrap();
    assert!(!pipeline.manager.stats("email").await.unwrap().enabled);

    assert!(matches!(
        pipeline.manager.enable("fax").await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn channel_test_updates_state() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[]).await;

    let ok = ScriptedChannel::new("sms");
    pipeline.manager.register_implementation(ok);
    pipeline.manager.test("sms", "+1").await.unwrap();
    let stats = pipeline.manager.stats("sms").await.unwrap();
    assert_eq!(stats.state, ChannelStatus::Enabled);
    assert!(stats.enabled);
    assert!(stats.last_test_at.is_some());
    assert!(stats.last_success_at.is_some());

    let failing = ScriptedChannel::with_script("pushover", vec![Err("bad token".to_string())]);
    pipeline.manager.register_implementation(failing);
    let err = pipeline
        .manager
        .test("pushover", "device")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad token"));
    let stats = pipeline.manager.stats("pushover").await.unwrap();
    assert_eq!(stats.state, ChannelStatus::Failed);
    assert_eq!(stats.failure_count, 1);
    assert_eq!(stats.last_error.as_deref(), Some("bad token"));

    // No implementation registered.
    let err = pipeline.manager.test("slack", "#ops").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Delivery(DeliveryError::ChannelNotFound(_))
    ));
    assert_eq!(
        pipeline.manager.stats("slack").await.unwrap().state,
        ChannelStatus::Failed
    );

    // Types outside the catalog have no state row to test against.
    let uncatalogued = ScriptedChannel::new("pager");
    pipeline
        .manager
        .register_implementation(Arc::clone(&uncatalogued) as Arc<dyn NotificationChannel>);
    let err = pipeline.manager.test("pager", "x").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert!(uncatalogued.sent_subjects().is_empty());
}

#[tokio::test]
async fn interrupted_entries_are_recovered() {
    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[]).await;

    let id = enqueue(&pipeline, "sms", "x").await;
    sqlx::query("UPDATE notification_queue SET state = 'sending' WHERE id = ?")
        .bind(&id)
        .execute(&pool)
        .await
        .unwrap();

    // Startup recovery runs as part of the pipeline start sequence.
    let restarted = pipeline_with(&pool, &[]).await;
    let entry = restarted.queue.get_entry(&id).await.unwrap();
    assert_eq!(entry.queue_state(), Some(QueueState::Queued));
}

#[tokio::test]
async fn maintenance_sweeps_delivered_and_history() {
    use courier::notification::{MaintenanceConfig, MaintenanceScheduler};

    let pool = setup_pool().await;
    let pipeline = pipeline_with(&pool, &[("notifications.history_retention_days", "7")]).await;
    install(&pipeline, ScriptedChannel::new("sms")).await;

    let id = enqueue(&pipeline, "sms", "x").await;
    tick(&pipeline).await;
    let old = now_ms() - 100 * DAY_MS;
    sqlx::query("UPDATE notification_queue SET delivered_at = ? WHERE id = ?")
        .bind(old)
        .bind(&id)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE notification_history SET created_at = ?")
        .bind(old)
        .execute(&pool)
        .await
        .unwrap();

    let scheduler = MaintenanceScheduler::new(
        Arc::clone(&pipeline.queue),
        Arc::clone(&pipeline.history),
        Arc::clone(&pipeline.policy),
        MaintenanceConfig::default(),
    );
    let report = scheduler.run_maintenance().await.unwrap();
    assert_eq!(report.delivered_deleted, 1);
    assert_eq!(report.history_deleted, 1);

    let again = scheduler.run_maintenance().await.unwrap();
    assert_eq!(again, Default::default());
}
