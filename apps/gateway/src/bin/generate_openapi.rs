use utoipa::OpenApi;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let doc = chat_gateway::routes::ApiDoc::openapi().to_pretty_json()?;
    let out = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../specs/chat-gateway.json");
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&out, doc)?;
    println!("Wrote {}", out.display());
    Ok(())
}
