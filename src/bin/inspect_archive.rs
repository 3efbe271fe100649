use futures::TryStreamExt;
use gmex::config::Config;
use gmex::models::ContentState;
use gmex::store::{EmailStore, ListQuery, StoreConfig};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <search_query>", args[0]);
        eprintln!("Search query matches against message id, sender or subject.");
        std::process::exit(1);
    }

    let needle = args[1].to_lowercase();
    let config = Config::load(None);
    let store = EmailStore::open(StoreConfig {
        root: config.store_root(),
        io_timeout: config.store.io_timeout(),
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to open archive: {}", e))?;

    let newest_first = ListQuery {
        newest_first: true,
        ..ListQuery::default()
    };
    let mut listing = store.list(&newest_first).await?;
    let mut found = None;
    while let Some(metadata) = listing.try_next().await? {
        let matches = |field: &Option<String>| {
            field
                .as_deref()
                .is_some_and(|v| v.to_lowercase().contains(&needle))
        };
        if metadata.id.as_str() == args[1] || matches(&metadata.from) || matches(&metadata.subject) {
            found = Some(metadata.id);
            break;
        }
    }

    let Some(id) = found else {
        println!("No messages found matching '{}'", args[1]);
        return Ok(());
    };

    let record = store.get(&id, true).await?;
    let meta = &record.metadata;
    println!("Found Message:");
    println!("Key: {}", record.key);
    println!("ID: {}", meta.id);
    println!("From: {:?}", meta.from);
    println!("Subject: {:?}", meta.subject);
    println!("Date: {}", meta.timestamp.to_rfc3339());
    println!("Labels: {:?}", meta.labels);
    println!(
        "--------------------------------------------------------------------------------"
    );
    match record.content {
        Some(ContentState::Populated(payload)) => {
            println!("BODY TEXT (Raw Debug):");
            println!("{:?}", payload.body_text);
            println!(
                "--------------------------------------------------------------------------------"
            );
            println!("BODY TEXT (Display):");
            println!("{}", payload.body_text);
            println!(
                "--------------------------------------------------------------------------------"
            );
            println!("BODY HTML (Raw Debug):");
            println!("{:?}", payload.body_html);
            println!("Attachments: {}", payload.attachments.len());
            for attachment in &payload.attachments {
                println!("  - {} ({:?})", attachment.filename, attachment.mime_type);
            }
        }
        _ => println!("CONTENT: pending (run `gmex fill`)"),
    }

    Ok(())
}
