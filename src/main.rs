use anyhow::Result;
use serde_json::json;
use std::rc::Rc;
use tether::config::{load_config, TetherConfig};
use tether::sync::Method;
use tether::{
    callback, names, Comparator, Group, GroupSchema, MockTransport, Observable, Payload, Schema,
    SyncOptions, ValidationFailure,
};
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => load_config(&path)?,
        None => TetherConfig::default(),
    }
    .with_env_overrides();

    info!(delay_ms = config.mock.delay_ms, "Tether demo starting...");

    let transport = Rc::new(MockTransport::from_config(&config.mock));
    transport.respond(
        Method::Get,
        json!({
            "data": [
                {"id": 3, "title": "The Tempest", "author": "William Shakespeare"},
                {"id": 1, "title": "Hamlet", "author": "William Shakespeare"},
                {"id": 2, "title": "Moby Dick", "author": "Herman Melville"}
            ],
            "page": 1,
            "total": 3
        }),
    );

    let book = Rc::new(
        Schema::from_config(&config)
            .named("book")
            .with_validator(|attrs| match attrs.get("title") {
                Some(title) if title.is_string() => Ok(()),
                _ => Err(ValidationFailure::at("title", "must be a string")),
            }),
    );
    let library = Group::new(
        Rc::new(
            GroupSchema::from_config(&config, book)
                .named("library")
                .with_url("/library")
                .with_comparator(Comparator::field("title"))
                .with_transport(transport.clone()),
        ),
        Vec::new(),
    );

    library.on(
        names::UPDATED,
        callback(|event| {
            if let Payload::Updated { changes, .. } = &event.payload {
                info!(
                    added = changes.added.len(),
                    removed = changes.removed.len(),
                    merged = changes.merged.len(),
                    "Library updated"
                );
            }
        }),
    );
    library.on(
        names::ERROR,
        callback(|event| warn!(event = %event.name, "Library sync failed")),
    );

    let request = library.fetch(SyncOptions::default())?;
    info!(url = %request.url, "Fetching library");

    let delivered = transport.settle().await;
    info!(delivered, books = library.len(), "Library loaded");

    for book in &library {
        info!(
            cid = %book.cid(),
            id = %book.id().unwrap_or_default(),
            title = %book.get("title").unwrap_or_default(),
            "Book"
        );
    }
    info!(
        page = %library.form().get("page").unwrap_or_default(),
        total = %library.form().get("total").unwrap_or_default(),
        "Form"
    );

    Ok(())
}
