#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_gateway::run().await
}
