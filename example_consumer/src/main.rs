//! Example consumer: a separate Rust project that uses relforge as a dependency.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Set `RELFORGE_MODEL` to a model file or directory to compile that instead of the built-in one.

use async_trait::async_trait;
use relforge::service::{AfterHook, JunctionLink, PreHook};
use relforge::{
    load_sources, plan_migrations, resolve, AppError, HookContext, HookOutcome, HookRegistry, MemoryStore,
    ModelDocument, Row, Runtime, TransactionOptions, UnitOfWork,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

const MODEL: &str = r#"{
  "entities": [
    {
      "name": "Student",
      "table": "students",
      "timestamps": true,
      "fields": [
        { "name": "id", "type": "integer", "primaryKey": true },
        { "name": "fullName", "type": "string", "required": true, "maxLength": 80 },
        { "name": "email", "type": "string", "unique": true, "pattern": "^[^@]+@[^@]+$" }
      ],
      "relationships": [
        { "type": "manyToMany", "target": "Course", "name": "courses", "through": "enrollments" }
      ]
    },
    {
      "name": "Course",
      "table": "courses",
      "fields": [
        { "name": "code", "type": "string", "primaryKey": true },
        { "name": "title", "type": "string", "required": true }
      ],
      "relationships": [
        { "type": "manyToMany", "target": "Student", "name": "students", "through": "enrollments" }
      ]
    }
  ]
}"#;

struct TrimName;

#[async_trait]
impl PreHook<Row> for TrimName {
    async fn call(&self, input: &Row, _: &HookContext, _: &mut UnitOfWork) -> Result<HookOutcome<Row>, AppError> {
        let mut next = input.clone();
        if let Some(Value::String(name)) = next.get("full_name") {
            let trimmed = name.trim().to_string();
            next.insert("full_name".into(), Value::String(trimmed));
        }
        Ok(HookOutcome::replace(next))
    }
}

struct AnnounceEnrollment;

#[async_trait]
impl AfterHook<JunctionLink, Row> for AnnounceEnrollment {
    async fn call(&self, link: &JunctionLink, _: &Row, ctx: &HookContext) -> Result<(), AppError> {
        tracing::info!(
            student = %link.source_id,
            course = %link.target_id,
            by = ?ctx.get("actor"),
            "enrolled"
        );
        Ok(())
    }
}

/// A model file, or every `*.json` file of a directory merged into one model.
fn read_model(path: &Path) -> Result<ModelDocument, Box<dyn std::error::Error>> {
    let files = if path.is_dir() {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let file = entry?.path();
            if file.extension().map(|ext| ext == "json").unwrap_or(false) {
                files.push(file);
            }
        }
        files
    } else {
        vec![path.to_path_buf()]
    };
    let mut sources = Vec::with_capacity(files.len());
    for file in files {
        let text = std::fs::read_to_string(&file)?;
        sources.push((file.display().to_string(), text));
    }
    Ok(load_sources(sources)?)
}

fn row(v: Value) -> Row {
    match v {
        Value::Object(m) => m,
        _ => Row::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relforge=info,example_consumer=info")),
        )
        .init();

    let doc = match std::env::var("RELFORGE_MODEL") {
        Ok(path) => read_model(Path::new(&path))?,
        Err(_) => ModelDocument::from_json_str(MODEL)?,
    };
    let schema = resolve(&doc)?;
    let plan = plan_migrations(&schema);
    for step in plan.forward() {
        tracing::info!(step = %serde_json::to_string(step)?, "plan");
    }
    tracing::info!(order = ?schema.creation_order(), drop = ?schema.drop_order(), "schema compiled");

    let mut hooks = HookRegistry::new();
    hooks.entity_mut("Student").create.pre(TrimName);
    hooks.junction_mut("enrollments").add.after(AnnounceEnrollment);

    let rt = Runtime::new(schema, Arc::new(MemoryStore::new()), hooks).with_options(TransactionOptions::from_env()?);
    let ctx = HookContext::new().with("actor", json!("registrar"));
    let students = rt.pipeline();

    let ana = students
        .create("Student", row(json!({ "fullName": "  Ana Ruiz ", "email": "ana@example.org" })), ctx.clone())
        .await?;
    for (code, title) in [("CS101", "Programming"), ("MA201", "Linear Algebra")] {
        students
            .create("Course", row(json!({ "code": code, "title": title })), ctx.clone())
            .await?;
    }
    let ana_id = ana.get("id").cloned().unwrap_or(Value::Null);

    let courses = rt.relation("Student", "courses")?;
    courses
        .add_many(ana_id.clone(), vec![json!("CS101"), json!("MA201")], ctx.clone())
        .await?;
    // Same junction from the other side; already linked, so no hooks fire.
    rt.relation("Course", "students")?
        .add_one(json!("CS101"), ana_id.clone(), Row::new(), ctx.clone())
        .await?;

    let enrolled = courses.list(ana_id.clone()).await?;
    tracing::info!(count = enrolled.len(), "courses for {}", ana.get("full_name").unwrap_or(&serde_json::Value::Null));
    Ok(())
}
