//! medguide-rag CLI 진입점

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // 로깅 초기화 (stdout은 결과 출력용이므로 stderr로)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MEDGUIDE_LOG")
                .unwrap_or_else(|_| EnvFilter::new("medguide_rag=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = medguide_rag::cli::Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(medguide_rag::cli::run(cli))
}
