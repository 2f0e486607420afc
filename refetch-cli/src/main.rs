// Copyright 2026 refetch Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `refetch-cli` drives the query cache against an in-process simulated JSON API.

mod api;
mod infinite;
mod posts;

use clap::{Parser, Subcommand};

use crate::{api::ApiArgs, infinite::InfiniteArgs, posts::PostsArgs};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    api: ApiArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk the paginated posts list, prefetching the next page, then delete and update a post.
    Posts(PostsArgs),
    /// Fetch a cursor-paged people listing until it is exhausted.
    Infinite(InfiniteArgs),
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let cli = Cli::parse();
    let api = api::Api::new(&cli.api);

    match cli.command {
        Command::Posts(args) => posts::run(api, args).await,
        Command::Infinite(args) => infinite::run(api, args).await,
    }
}
