#[tokio::main]
async fn main() -> anyhow::Result<()> {
    extshell_lib::run().await
}
