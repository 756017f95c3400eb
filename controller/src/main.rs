mod api;
mod host;
mod relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
