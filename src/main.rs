use std::process;
use wssocks::cli::Cli;

fn main() {
    let cli = Cli::new();

    if let Err(err) = cli.execute() {
        eprintln!("{}", err);
        process::exit(1);
    }
}
