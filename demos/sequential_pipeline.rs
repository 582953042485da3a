// This demo runs a three-stage content pipeline with the sequential topology.
// Each stage is a scripted agent, so no API keys are needed.
//
// Example usage:
// ```
// RUST_LOG=ensemble=debug cargo run --example sequential_pipeline
// ```

use ensemble::agent::{Agent, FnAgent};
use ensemble::orchestration::{Orchestration, OrchestrationBuilder};
use ensemble::runtime::Runtime;
use ensemble::sequential::SequentialOrchestration;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ensemble::init_logger();

    println!("=== Sequential Pipeline Demo ===\n");

    let analyst: Arc<dyn Agent> = Arc::new(
        FnAgent::text("ConceptExtractor", |history| {
            let product = history
                .last()
                .map(|m| m.content.to_string())
                .unwrap_or_default();
            format!(
                "Key features of {}: lightweight aluminium frame, 18 hour battery, \
                 fold-flat design. Audience: commuters.",
                product
            )
        })
        .with_description("Extracts key features and audience from a product description"),
    );

    let writer: Arc<dyn Agent> = Arc::new(
        FnAgent::text("Writer", |history| {
            let features = history
                .last()
                .map(|m| m.content.to_string())
                .unwrap_or_default();
            format!(
                "Draft: Meet the bike that keeps up with your day. ({})",
                features
            )
        })
        .with_description("Writes marketing copy from the extracted features"),
    );

    let editor: Arc<dyn Agent> = Arc::new(
        FnAgent::text("FormatProof", |history| {
            let draft = history
                .last()
                .map(|m| m.content.to_string())
                .unwrap_or_default();
            draft.replace("Draft: ", "").trim().to_string()
        })
        .with_description("Polishes grammar and format"),
    );

    let pipeline = SequentialOrchestration::new(vec![analyst, writer, editor])
        .with_name("marketing")
        .with_agent_response_callback(|message| {
            println!(
                "# {}\n{}\n",
                message.name.as_deref().unwrap_or("?"),
                message.content
            );
        });

    let runtime = Runtime::new();
    runtime.start()?;

    let result = pipeline
        .invoke("an eco-friendly folding e-bike", &runtime, None)
        .await?;
    let final_copy = result.get(Some(Duration::from_secs(30))).await?;
    println!("***** Final Result *****\n{}", final_copy.content);

    runtime.stop_when_idle().await?;
    Ok(())
}
