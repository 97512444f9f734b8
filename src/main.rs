#[tokio::main]
async fn main() -> eyre::Result<()> {
    mailgate::run().await
}
