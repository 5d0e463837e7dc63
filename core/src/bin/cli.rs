/// CLI for a running ChatLink session
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    chatlink_core::cli_app::run(args).await
}
