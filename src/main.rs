#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(err) = edgesense_lib::run().await {
        log::error!("edgesense failed: {err:#}");
        return Err(err);
    }
    Ok(())
}
