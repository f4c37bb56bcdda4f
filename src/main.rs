use rask_apm_client::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::main().await
}
