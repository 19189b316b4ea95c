//! gantryd 入口。

use clap::Parser;
use gantryd::cli::Cli;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match gantryd::run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("gantryd: {err:#}");
            ExitCode::FAILURE
        }
    }
}
