use clap::Parser;
use measurectl::cmd_csa::{self, Cli};
use measurectl::common;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    common::init_tracing(cli.common.verbose);
    let code = match cmd_csa::run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}
