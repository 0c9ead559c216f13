//! End-to-end publishing against an in-memory SQLite content store
//!
//! Worker -> JobGroup -> BatchTransactionHooks -> TransactionScope -> SqliteContentStore

use contentmap_core::application::{Job, JobContext, PublishContext, PublishObjectJob, Worker};
use contentmap_core::domain::{ContentObject, PublishConfig, PublishOp, WorkerConfig, WorkerState};
use contentmap_core::error::PublishError;
use contentmap_core::port::publish_handler::mocks::RecordingHandler;
use contentmap_infra_sqlite::{create_pool, run_migrations, SqliteContentStore};
use serde_json::json;
use std::sync::Arc;

const TARGET: &str = "cr_trx_1";

struct Fixture {
    ctx: Arc<PublishContext>,
    store: Arc<SqliteContentStore>,
    handler: Arc<RecordingHandler>,
}

async fn setup(config: PublishConfig) -> Fixture {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();

    let store = Arc::new(SqliteContentStore::new(pool));
    let handler = Arc::new(RecordingHandler::new("h"));
    let ctx = Arc::new(PublishContext::new(config, vec![]));
    ctx.register_target(TARGET, store.clone(), vec![handler.clone()]);

    Fixture {
        ctx,
        store,
        handler,
    }
}

fn article(id: u64, name: &str) -> ContentObject {
    ContentObject::new(10007, id).with_attribute("name", json!(name))
}

fn job(fixture: &Fixture, op: PublishOp) -> Box<dyn Job> {
    Box::new(PublishObjectJob::new(Arc::clone(&fixture.ctx), TARGET, op))
}

fn count_events(handler: &RecordingHandler, event: &str) -> usize {
    handler.events().iter().filter(|e| e.as_str() == event).count()
}

#[tokio::test]
async fn test_queued_jobs_publish_in_one_transaction() {
    let fixture = setup(PublishConfig::default()).await;
    let worker = Worker::new(WorkerConfig::new("publish"));
    worker.start().unwrap();

    for id in 1..=20 {
        let object = article(id, &format!("article {}", id));
        worker.submit(job(&fixture, PublishOp::Create { object })).unwrap();
    }
    worker.flush().await;

    assert_eq!(fixture.store.count().await.unwrap(), 20);
    assert_eq!(count_events(&fixture.handler, "h open"), 1);
    assert_eq!(count_events(&fixture.handler, "h commit"), 1);
    assert!(worker.last_error().is_ok());
    assert_eq!(worker.stats().work_units, 20);
    assert_eq!(fixture.ctx.locks().available_permits(TARGET), 1);

    worker.stop();
    worker.join().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_group_limit_splits_batches() {
    let config = PublishConfig {
        group_limit: 4,
        ..PublishConfig::default()
    };
    let fixture = setup(config).await;
    let worker = Worker::new(WorkerConfig::new("publish"));
    worker.start().unwrap();

    for id in 1..=10 {
        worker
            .submit(job(&fixture, PublishOp::Create { object: article(id, "a") }))
            .unwrap();
    }
    worker.flush().await;

    // 4 + 4 + 2
    assert_eq!(count_events(&fixture.handler, "h commit"), 3);
    assert_eq!(fixture.store.count().await.unwrap(), 10);
}

#[tokio::test]
async fn test_update_and_delete_round() {
    let fixture = setup(PublishConfig::default()).await;
    let worker = Worker::new(WorkerConfig::new("publish"));
    worker.start().unwrap();

    worker
        .submit(job(&fixture, PublishOp::Create { object: article(1, "draft") }))
        .unwrap();
    worker
        .submit(job(&fixture, PublishOp::Create { object: article(2, "other") }))
        .unwrap();
    worker.flush().await;

    worker
        .submit(job(
            &fixture,
            PublishOp::Update {
                object: article(1, "final").with_attribute("teaser", json!("t")),
                previous: Some(article(1, "draft")),
                changed: vec![],
            },
        ))
        .unwrap();
    worker
        .submit(job(&fixture, PublishOp::Delete { object: article(2, "other") }))
        .unwrap();
    worker.flush().await;

    let published = fixture.store.find(10007, 1).await.unwrap().unwrap();
    assert_eq!(published.attributes["name"], json!("final"));
    assert!(fixture.store.find(10007, 2).await.unwrap().is_none());
    assert!(fixture
        .handler
        .events()
        .contains(&"h update 10007.1 [name,teaser]".to_string()));
}

#[tokio::test]
async fn test_invalid_member_does_not_cost_the_rest_of_its_batch() {
    let fixture = setup(PublishConfig::default()).await;
    let worker = Worker::new(WorkerConfig::new("publish"));
    worker.start().unwrap();

    for id in 1..=4 {
        let object = if id == 2 {
            ContentObject::new(0, id)
        } else {
            article(id, "ok")
        };
        worker.submit(job(&fixture, PublishOp::Create { object })).unwrap();
    }
    worker.flush().await;

    assert_eq!(fixture.store.count().await.unwrap(), 3);
    assert!(fixture.store.find(0, 2).await.unwrap().is_none());
    let stats = worker.stats();
    assert_eq!(stats.work_units, 3);
    assert_eq!(stats.failures, 1);
    match worker.last_error() {
        Err(PublishError::JobFailed { job, .. }) => assert_eq!(job, "create 0.2 on cr_trx_1"),
        other => panic!("expected JobFailed, got {:?}", other),
    }
    assert_eq!(fixture.ctx.locks().available_permits(TARGET), 1);

    // the worker keeps going
    worker
        .submit(job(&fixture, PublishOp::Create { object: article(5, "later") }))
        .unwrap();
    worker.flush().await;
    assert_eq!(fixture.store.count().await.unwrap(), 4);
    assert_eq!(worker.state(), WorkerState::Running);
}

#[tokio::test]
async fn test_exit_on_error_fails_worker() {
    let fixture = setup(PublishConfig::default()).await;
    let worker = Worker::new(WorkerConfig::new("publish").with_exit_on_error(true));
    worker.start().unwrap();

    worker
        .submit(job(
            &fixture,
            PublishOp::Create {
                object: ContentObject::new(-1, 1),
            },
        ))
        .unwrap();
    worker.join().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Failed);
    let rejected = worker.submit(job(&fixture, PublishOp::Create { object: article(1, "x") }));
    assert!(matches!(rejected, Err(PublishError::Rejected { .. })));
}

#[tokio::test]
async fn test_scope_used_directly() {
    let fixture = setup(PublishConfig::default()).await;

    let mut scope = fixture.ctx.begin(TARGET).await.unwrap();
    scope.create_object(&article(7, "direct")).await.unwrap();
    scope.mark_success();
    scope.close().await.unwrap();

    // a standalone job outside the worker
    let mut standalone = PublishObjectJob::new(
        Arc::clone(&fixture.ctx),
        TARGET,
        PublishOp::Delete {
            object: article(7, "direct"),
        },
    );
    let units = standalone
        .process(&JobContext::detached("test"))
        .await
        .unwrap();

    assert_eq!(units, 1);
    assert_eq!(fixture.store.count().await.unwrap(), 0);
    assert_eq!(count_events(&fixture.handler, "h commit"), 2);
}
