use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    transgate::run().await
}
