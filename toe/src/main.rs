mod cli;
mod demo;
mod logging;

/// Runs the loopback demo with the given command line arguments
#[tokio::main]
async fn main() {
    println!("toe v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = cli::run_from_arguments().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("Done");
}
