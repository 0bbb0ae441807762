use async_trait::async_trait;
use relforge::service::{AfterHook, FindOneInput, JunctionLink, ListQuery, PostHook, PreHook};
use relforge::{
    resolve, AfterHookDispatch, AppError, HookContext, HookOutcome, HookRegistry, MemoryStore, ModelDocument, Row,
    Runtime, TransactionOptions, UnitOfWork,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn model() -> ModelDocument {
    ModelDocument::from_value(json!({
        "entities": [
            {
                "name": "Post",
                "table": "posts",
                "softDelete": true,
                "fields": [
                    { "name": "id", "type": "integer", "primaryKey": true },
                    { "name": "title", "type": "string", "required": true, "maxLength": 40 }
                ],
                "relationships": [
                    { "type": "manyToMany", "target": "Tag", "name": "tags", "through": "post_tags" },
                    { "type": "oneToMany", "target": "Comment", "name": "comments" }
                ]
            },
            {
                "name": "Tag",
                "table": "tags",
                "fields": [
                    { "name": "id", "type": "integer", "primaryKey": true },
                    { "name": "label", "type": "string", "required": true }
                ],
                "relationships": [
                    { "type": "manyToMany", "target": "Post", "name": "posts", "through": "post_tags" }
                ]
            },
            {
                "name": "Comment",
                "table": "comments",
                "fields": [
                    { "name": "id", "type": "integer", "primaryKey": true },
                    { "name": "body", "type": "text", "required": true }
                ]
            }
        ]
    }))
    .unwrap()
}

fn runtime(hooks: HookRegistry) -> (Runtime, MemoryStore) {
    let store = MemoryStore::new();
    let rt = Runtime::new(resolve(&model()).unwrap(), Arc::new(store.clone()), hooks).with_options(TransactionOptions {
        after_hooks: AfterHookDispatch::Inline,
        max_retries: 2,
        ..Default::default()
    });
    (rt, store)
}

fn row(v: Value) -> Row {
    v.as_object().cloned().unwrap()
}

async fn seed(rt: &Runtime) {
    let p = rt.pipeline();
    for title in ["first", "second"] {
        p.create("Post", row(json!({ "title": title })), HookContext::new()).await.unwrap();
    }
    for label in ["rust", "sql", "async"] {
        p.create("Tag", row(json!({ "label": label })), HookContext::new()).await.unwrap();
    }
}

struct CountPre<I>(Arc<AtomicUsize>, std::marker::PhantomData<fn(I)>);

impl<I> CountPre<I> {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        CountPre(counter.clone(), std::marker::PhantomData)
    }
}

#[async_trait]
impl<I: Send + Sync> PreHook<I> for CountPre<I> {
    async fn call(&self, _: &I, _: &HookContext, _: &mut UnitOfWork) -> Result<HookOutcome<I>, AppError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(HookOutcome::keep())
    }
}

struct CountAfter(Arc<AtomicUsize>);

#[async_trait]
impl AfterHook<Row, Row> for CountAfter {
    async fn call(&self, _: &Row, _: &Row, _: &HookContext) -> Result<(), AppError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records the canonical (source, target) pair every pre hook call receives.
struct RecordPairs(Arc<Mutex<Vec<(Value, Value)>>>);

#[async_trait]
impl PreHook<JunctionLink> for RecordPairs {
    async fn call(&self, link: &JunctionLink, _: &HookContext, _: &mut UnitOfWork) -> Result<HookOutcome<JunctionLink>, AppError> {
        self.0.lock().unwrap().push((link.source_id.clone(), link.target_id.clone()));
        Ok(HookOutcome::keep())
    }
}

/// Appends "<stage> <target id>" for every junction hook stage.
#[derive(Clone)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn note(&self, stage: &str, link: &JunctionLink) {
        self.0.lock().unwrap().push(format!("{} {}", stage, link.target_id));
    }
}

#[async_trait]
impl PreHook<JunctionLink> for Journal {
    async fn call(&self, link: &JunctionLink, _: &HookContext, _: &mut UnitOfWork) -> Result<HookOutcome<JunctionLink>, AppError> {
        self.note("pre", link);
        Ok(HookOutcome::keep())
    }
}

#[async_trait]
impl PostHook<JunctionLink, Row> for Journal {
    async fn call(&self, link: &JunctionLink, _: &Row, _: &HookContext, _: &mut UnitOfWork) -> Result<HookOutcome<Row>, AppError> {
        self.note("post", link);
        Ok(HookOutcome::keep())
    }
}

#[async_trait]
impl AfterHook<JunctionLink, Row> for Journal {
    async fn call(&self, link: &JunctionLink, _: &Row, _: &HookContext) -> Result<(), AppError> {
        self.note("after", link);
        Ok(())
    }
}

struct RecordLinks(Arc<Mutex<Vec<Value>>>);

#[async_trait]
impl AfterHook<JunctionLink, Row> for RecordLinks {
    async fn call(&self, link: &JunctionLink, _: &Row, _: &HookContext) -> Result<(), AppError> {
        self.0.lock().unwrap().push(link.target_id.clone());
        Ok(())
    }
}

#[tokio::test]
async fn junction_hooks_see_the_same_pair_from_either_side() {
    let adds = Arc::new(Mutex::new(Vec::new()));
    let removes = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = HookRegistry::new();
    hooks.junction_mut("post_tags").add.pre(RecordPairs(adds.clone()));
    hooks.junction_mut("post_tags").remove.pre(RecordPairs(removes.clone()));
    let (rt, store) = runtime(hooks);
    seed(&rt).await;

    let from_post = rt.relation("Post", "tags").unwrap();
    let from_tag = rt.relation("Tag", "posts").unwrap();
    from_post.add_one(json!(1), json!(2), Row::new(), HookContext::new()).await.unwrap();
    assert_eq!(*adds.lock().unwrap(), vec![(json!(1), json!(2))]);

    // Same pair from the other side: already linked, nothing fires.
    from_tag.add_one(json!(2), json!(1), Row::new(), HookContext::new()).await.unwrap();
    assert_eq!(adds.lock().unwrap().len(), 1);

    // Tag 3 links post 2; the hook still sees (post, tag).
    from_tag.add_one(json!(3), json!(2), Row::new(), HookContext::new()).await.unwrap();
    assert_eq!(*adds.lock().unwrap(), vec![(json!(1), json!(2)), (json!(2), json!(3))]);

    let links = store.rows("post_tags");
    assert_eq!(links.len(), 2);
    assert!(links
        .iter()
        .any(|l| l.get("post_id") == Some(&json!(2)) && l.get("tag_id") == Some(&json!(3))));
    assert!(from_tag.has(json!(2), json!(1)).await.unwrap());
    assert!(!from_post.has(json!(1), json!(3)).await.unwrap());

    from_tag.remove_one(json!(3), json!(2), HookContext::new()).await.unwrap();
    assert_eq!(*removes.lock().unwrap(), vec![(json!(2), json!(3))]);
    assert_eq!(store.rows("post_tags").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn conflicted_attempt_is_retried_and_after_hooks_run_once() {
    let after = Arc::new(AtomicUsize::new(0));
    let pre = Arc::new(AtomicUsize::new(0));
    let mut hooks = HookRegistry::new();
    hooks
        .entity_mut("Comment")
        .create
        .pre(CountPre::new(&pre))
        .after(CountAfter(after.clone()));
    let (rt, store) = runtime(hooks);

    store.fail_next_commits(1);
    let created = rt
        .pipeline()
        .create("Comment", row(json!({ "body": "hello" })), HookContext::new())
        .await
        .unwrap();
    assert_eq!(created.get("body"), Some(&json!("hello")));
    assert_eq!(pre.load(Ordering::SeqCst), 2);
    assert_eq!(after.load(Ordering::SeqCst), 1);
    assert_eq!(store.commit_count(), 1);
    assert_eq!(store.rollback_count(), 1);
    assert_eq!(store.rows("comments").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_bounds_attempts() {
    let (rt, _store) = runtime(HookRegistry::new());

    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let res: Result<(), AppError> = rt
        .transaction(move |_uow| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(AppError::serialization_conflict())
            })
        })
        .await;
    assert!(matches!(res, Err(AppError::SerializationConflict { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let res: Result<(), AppError> = rt
        .transaction(move |_uow| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(AppError::BadRequest("no".into()))
            })
        })
        .await;
    assert!(matches!(res, Err(AppError::BadRequest(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_disabled_makes_one_attempt() {
    let store = MemoryStore::new();
    let rt = Runtime::new(resolve(&model()).unwrap(), Arc::new(store.clone()), HookRegistry::new()).with_options(
        TransactionOptions {
            enable_retry: false,
            ..Default::default()
        },
    );
    store.fail_next_commits(1);
    let err = rt
        .pipeline()
        .create("Tag", row(json!({ "label": "x" })), HookContext::new())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(store.rows("tags").is_empty());
}

struct Lengthen;

#[async_trait]
impl PreHook<Row> for Lengthen {
    async fn call(&self, input: &Row, _: &HookContext, _: &mut UnitOfWork) -> Result<HookOutcome<Row>, AppError> {
        let mut next = input.clone();
        next.insert("title".into(), json!("x".repeat(100)));
        Ok(HookOutcome::replace(next))
    }
}

#[tokio::test]
async fn pre_hook_output_is_validated_again() {
    let mut hooks = HookRegistry::new();
    hooks.entity_mut("Post").create.pre(Lengthen);
    let (rt, store) = runtime(hooks);
    let err = rt
        .pipeline()
        .create("Post", row(json!({ "title": "short" })), HookContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{:?}", err);
    assert!(store.rows("posts").is_empty());
}

struct Explode;

#[async_trait]
impl AfterHook<Row, Row> for Explode {
    async fn call(&self, _: &Row, _: &Row, _: &HookContext) -> Result<(), AppError> {
        Err(AppError::Store("mailer down".into()))
    }
}

#[tokio::test]
async fn after_hook_failure_does_not_fail_the_operation() {
    let mut hooks = HookRegistry::new();
    hooks.entity_mut("Tag").create.after(Explode);
    let (rt, store) = runtime(hooks);
    let tag = rt
        .pipeline()
        .create("Tag", row(json!({ "label": "ok" })), HookContext::new())
        .await
        .unwrap();
    assert_eq!(tag.get("id"), Some(&json!(1)));
    assert_eq!(store.rows("tags").len(), 1);
}

#[tokio::test]
async fn add_many_keeps_caller_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = HookRegistry::new();
    hooks.junction_mut("post_tags").add.after(RecordLinks(seen.clone()));
    let (rt, _store) = runtime(hooks);
    seed(&rt).await;

    let tags = rt.relation("Post", "tags").unwrap();
    let rows = tags
        .add_many(json!(1), vec![json!(3), json!(1), json!(2)], HookContext::new())
        .await
        .unwrap();
    let targets: Vec<Value> = rows.iter().filter_map(|r| r.get("tag_id").cloned()).collect();
    assert_eq!(targets, vec![json!(3), json!(1), json!(2)]);
    assert_eq!(*seen.lock().unwrap(), vec![json!(3), json!(1), json!(2)]);

    let listed = tags.list(json!(1)).await.unwrap();
    assert_eq!(listed.len(), 3);

    let err = tags.add_one(json!(1), json!(99), Row::new(), HookContext::new()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn add_many_runs_each_cycle_then_after_hooks_post_commit() {
    let journal = Journal(Arc::new(Mutex::new(Vec::new())));
    let mut hooks = HookRegistry::new();
    hooks
        .junction_mut("post_tags")
        .add
        .pre(journal.clone())
        .post(journal.clone())
        .after(journal.clone());
    let (rt, store) = runtime(hooks);
    seed(&rt).await;

    let commits = store.commit_count();
    rt.relation("Post", "tags")
        .unwrap()
        .add_many(json!(2), vec![json!(2), json!(3), json!(1)], HookContext::new())
        .await
        .unwrap();
    assert_eq!(store.commit_count(), commits + 1);
    assert_eq!(
        *journal.0.lock().unwrap(),
        vec!["pre 2", "post 2", "pre 3", "post 3", "pre 1", "post 1", "after 2", "after 3", "after 1"]
    );
}

struct RedirectTo(Value);

#[async_trait]
impl PreHook<JunctionLink> for RedirectTo {
    async fn call(&self, link: &JunctionLink, _: &HookContext, _: &mut UnitOfWork) -> Result<HookOutcome<JunctionLink>, AppError> {
        let mut next = link.clone();
        next.target_id = self.0.clone();
        Ok(HookOutcome::replace(next))
    }
}

#[tokio::test]
async fn pre_hook_redirect_onto_existing_link_is_idempotent() {
    let journal = Journal(Arc::new(Mutex::new(Vec::new())));
    let mut hooks = HookRegistry::new();
    hooks
        .junction_mut("post_tags")
        .add
        .pre(RedirectTo(json!(1)))
        .post(journal.clone())
        .after(journal.clone());
    let (rt, store) = runtime(hooks);
    seed(&rt).await;

    let tags = rt.relation("Post", "tags").unwrap();
    let first = tags.add_one(json!(1), json!(2), Row::new(), HookContext::new()).await.unwrap();
    assert_eq!(first.get("tag_id"), Some(&json!(1)));

    let again = tags.add_one(json!(1), json!(3), Row::new(), HookContext::new()).await.unwrap();
    assert_eq!(again.get("tag_id"), Some(&json!(1)));
    assert_eq!(store.rows("post_tags").len(), 1);
    assert_eq!(*journal.0.lock().unwrap(), vec!["post 1", "after 1"]);
}

#[tokio::test]
async fn remove_and_replace_links() {
    let (rt, store) = runtime(HookRegistry::new());
    seed(&rt).await;
    let tags = rt.relation("Post", "tags").unwrap();
    tags.add_many(json!(1), vec![json!(1), json!(2)], HookContext::new()).await.unwrap();

    assert!(matches!(
        tags.remove_one(json!(1), json!(3), HookContext::new()).await,
        Err(AppError::NotFound(_))
    ));
    let removed = tags
        .remove_many(json!(1), vec![json!(3), json!(1)], HookContext::new())
        .await
        .unwrap();
    assert_eq!(removed.len(), 1);

    tags.set_all(json!(1), vec![json!(3)], HookContext::new()).await.unwrap();
    let links = store.rows("post_tags");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].get("tag_id"), Some(&json!(3)));
}

#[tokio::test]
async fn includes_are_loaded_in_batches() {
    let (rt, _store) = runtime(HookRegistry::new());
    seed(&rt).await;
    let p = rt.pipeline();
    rt.relation("Post", "tags")
        .unwrap()
        .add_many(json!(1), vec![json!(1), json!(2)], HookContext::new())
        .await
        .unwrap();
    p.create("Comment", row(json!({ "body": "nice", "postId": 2 })), HookContext::new())
        .await
        .unwrap();

    let posts = p
        .find_many(
            "Post",
            ListQuery {
                include: vec!["tags".into(), "comments".into()],
                ..Default::default()
            },
            HookContext::new(),
        )
        .await
        .unwrap();
    let tag_counts: Vec<usize> = posts
        .iter()
        .map(|p| p.get("tags").and_then(Value::as_array).map(Vec::len).unwrap_or(0))
        .collect();
    let comment_counts: Vec<usize> = posts
        .iter()
        .map(|p| p.get("comments").and_then(Value::as_array).map(Vec::len).unwrap_or(0))
        .collect();
    assert_eq!(tag_counts, vec![2, 0]);
    assert_eq!(comment_counts, vec![0, 1]);

    let tag = p
        .find_one("Tag", FindOneInput { id: json!(2), include: vec!["posts".into()] }, HookContext::new())
        .await
        .unwrap();
    let posts = tag.get("posts").and_then(Value::as_array).unwrap();
    assert_eq!(posts[0].get("title"), Some(&json!("first")));

    let bad = p
        .find_many(
            "Post",
            ListQuery {
                include: vec!["authors".into()],
                ..Default::default()
            },
            HookContext::new(),
        )
        .await;
    assert!(matches!(bad, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn soft_deleted_posts_drop_out_of_reads_and_links() {
    let (rt, store) = runtime(HookRegistry::new());
    seed(&rt).await;
    let p = rt.pipeline();
    p.delete("Post", json!(1), HookContext::new()).await.unwrap();

    let posts = p.find_many("Post", ListQuery::default(), HookContext::new()).await.unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(store.rows("posts").len(), 2);
    let err = rt
        .relation("Tag", "posts")
        .unwrap()
        .add_one(json!(1), json!(1), Row::new(), HookContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

struct AuditTitle;

#[async_trait]
impl PostHook<Row, Row> for AuditTitle {
    async fn call(&self, _: &Row, output: &Row, _: &HookContext, _: &mut UnitOfWork) -> Result<HookOutcome<Row>, AppError> {
        if output.get("title") == Some(&json!("doomed")) {
            return Err(AppError::Conflict("title taken".into()));
        }
        Ok(HookOutcome::keep())
    }
}

#[tokio::test]
async fn unit_of_work_spans_several_operations() {
    let mut hooks = HookRegistry::new();
    hooks.entity_mut("Post").create.post(AuditTitle);
    let (rt, store) = runtime(hooks);
    let p = rt.pipeline();

    let res: Result<(), AppError> = rt
        .transaction(move |uow| {
            let p = p.clone();
            Box::pin(async move {
                p.create_in(uow, "Tag", row(json!({ "label": "kept?" })), HookContext::new()).await?;
                p.create_in(uow, "Post", row(json!({ "title": "doomed" })), HookContext::new()).await?;
                Ok(())
            })
        })
        .await;
    match res {
        Err(AppError::HookAbort { verb, stage, .. }) => assert_eq!((verb, stage), ("create", "post")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(store.rows("tags").is_empty());
    assert!(store.rows("posts").is_empty());
}

#[tokio::test]
async fn unknown_names_are_rejected() {
    let (rt, _store) = runtime(HookRegistry::new());
    assert!(matches!(rt.junction("nope"), Err(AppError::UnknownEntity(_))));
    assert!(matches!(rt.relation("Post", "comments"), Err(AppError::BadRequest(_))));
    assert!(rt.junction("post_tags").is_ok());
}
