// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

mod cli;
mod env;
mod util;

pub use env::Env;

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = cli::process().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
